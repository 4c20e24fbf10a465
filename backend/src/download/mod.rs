//! Download manager: per-filename in-flight registry, progress broadcast
//! and streamed transfers with size validation

mod manager;
mod task;

pub use manager::{
    filename_from_url, DownloadManager, DownloadRequest, DownloadTicket, InFlightDownload,
    ProgressUpdate, TransferState,
};
pub use task::download_file;
