//! Events pushed to whoever drives the user interface.

use std::net::IpAddr;

use tokio::sync::mpsc;

/// Something a peer did over the chat transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    NewPeer { address: IpAddr, username: String },
    MessagePosted { id: String, sender: String, content: String },
    MessageEdited { id: String, content: String },
    MessageDeleted { id: String },
}

pub type EventSender = mpsc::UnboundedSender<ChatEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ChatEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStatus {
    Start,
    Progress,
    Done,
    Error,
}

/// One step of a folder download.
///
/// `overall_ratio` is the 1-based index of the current file over the file
/// count, not a byte-weighted figure.
#[derive(Debug, Clone, PartialEq)]
pub struct FolderProgress {
    pub relative_path: String,
    pub status: ProgressStatus,
    pub file_ratio: f64,
    pub overall_ratio: f64,
    pub error: Option<String>,
}
