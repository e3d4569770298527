use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "kino")]
#[command(author, version, about = "Watch-together rooms with an HLS transcoding pipeline")]
pub struct Cli {
    /// Path to config file (YAML or TOML)
    #[arg(short, long, global = true, env = "KINO_CONFIG_PATH")]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Serve room and status WebSockets
    Serve {
        /// Also consume transcode jobs in this process
        #[arg(long)]
        with_worker: bool,
    },

    /// Consume transcode jobs until interrupted
    Worker,

    /// Submit a transcode job
    Enqueue {
        /// Object key of the uploaded source video
        storage_key: String,

        /// Video record to drive through the status machine
        #[arg(long)]
        video_id: Option<i64>,

        /// Write placeholder renditions instead of encoding
        #[arg(long)]
        simulate: bool,
    },
}
