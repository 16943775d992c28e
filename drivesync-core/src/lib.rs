mod client;
mod throttle;

pub use client::{
    DriveClient, DriveError, DriveFile, UploadOptions, escape_query,
};
pub use throttle::BandwidthLimiter;
pub use tokio_util::sync::CancellationToken;
