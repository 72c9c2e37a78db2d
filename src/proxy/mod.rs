pub mod handler;
pub mod relay;
pub mod stream;
pub mod upstream;
