use clap::{Parser, Subcommand};

/// reelgate — shareable streaming links for private cloud-drive videos
#[derive(Parser)]
#[command(name = "reelgate", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the streaming server
    Serve {
        /// Port to bind (defaults to REELGATE_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Manage published links
    Link {
        #[command(subcommand)]
        command: LinkCommands,
    },

    /// Inspect or refresh the upstream access token
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
}

#[derive(Subcommand)]
pub enum LinkCommands {
    /// Publish a resource (or print its existing link)
    Create {
        #[arg(long)]
        resource_id: String,
        /// Cosmetic file name appended to the path
        #[arg(long)]
        file_name: Option<String>,
    },
    /// Print the resource behind a slug
    Resolve { slug: String },
    /// Delete a link immediately
    Revoke { slug: String },
    /// Delete links older than the retention window
    Purge {
        /// Override REELGATE_LINK_RETENTION_HOURS
        #[arg(long)]
        hours: Option<u64>,
    },
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Show the cached token without refreshing it
    Show,
    /// Obtain a new token from the identity provider now
    Refresh,
}
