pub mod sqlite;

pub use sqlite::{generate_slug, SlugRecord, SlugStore};
