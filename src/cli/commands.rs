use clap::Subcommand;

use super::record::RecordArgs;

#[derive(Subcommand, Clone)]
pub enum Commands {
    /// Record a page into a video file
    Record(RecordArgs),

    /// Show which browser and encoder would be used
    Check,
}
