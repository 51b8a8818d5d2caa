//! Lifecycle status vocabularies for chunks, files and storage links
//!
//! Upload and download statuses persist as the short codes the node has
//! always written (`us0`, `ds99`, ...); link statuses persist as lowercase
//! words.

use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Upload lifecycle for a chunk or file
///
/// ```text
/// Created -> Uploading -> Uploaded
/// Uploaded -> Uploading   (a live copy lapses or the target rises)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Created,
    /// Needs more (or renewed) replicas
    Uploading,
    Uploaded,
}

impl UploadStatus {
    pub const ALL: [UploadStatus; 3] = [
        UploadStatus::Created,
        UploadStatus::Uploading,
        UploadStatus::Uploaded,
    ];

    pub fn as_code(&self) -> &'static str {
        match self {
            UploadStatus::Created => "us0",
            UploadStatus::Uploading => "us1",
            UploadStatus::Uploaded => "us99",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadStatus::Created => write!(f, "created"),
            UploadStatus::Uploading => write!(f, "uploading"),
            UploadStatus::Uploaded => write!(f, "uploaded"),
        }
    }
}

impl FromStr for UploadStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UploadStatus::ALL
            .into_iter()
            .find(|status| status.as_code() == s)
            .ok_or_else(|| StorageError::InvalidInput(format!("Unknown upload status: {}", s)))
    }
}

/// Download lifecycle for a chunk or file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Created,
    Downloading,
    Downloaded,
    Failed,
}

impl DownloadStatus {
    pub const ALL: [DownloadStatus; 4] = [
        DownloadStatus::Created,
        DownloadStatus::Downloading,
        DownloadStatus::Downloaded,
        DownloadStatus::Failed,
    ];

    pub fn as_code(&self) -> &'static str {
        match self {
            DownloadStatus::Created => "ds0",
            DownloadStatus::Downloading => "ds1",
            DownloadStatus::Downloaded => "ds99",
            DownloadStatus::Failed => "ds2",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadStatus::Created => write!(f, "created"),
            DownloadStatus::Downloading => write!(f, "downloading"),
            DownloadStatus::Downloaded => write!(f, "downloaded"),
            DownloadStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for DownloadStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DownloadStatus::ALL
            .into_iter()
            .find(|status| status.as_code() == s)
            .ok_or_else(|| StorageError::InvalidInput(format!("Unknown download status: {}", s)))
    }
}

/// Status of a replication agreement with one provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Proposed,
    /// Accepted by the provider: a live copy
    Signed,
    Rejected,
    Expired,
}

impl LinkStatus {
    pub const ALL: [LinkStatus; 4] = [
        LinkStatus::Proposed,
        LinkStatus::Signed,
        LinkStatus::Rejected,
        LinkStatus::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Proposed => "proposed",
            LinkStatus::Signed => "signed",
            LinkStatus::Rejected => "rejected",
            LinkStatus::Expired => "expired",
        }
    }

    /// Only signed agreements count toward redundancy
    pub fn is_live(&self) -> bool {
        matches!(self, LinkStatus::Signed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkStatus::Rejected | LinkStatus::Expired)
    }

    /// Whether an agreement may move from `self` to `next`
    pub fn can_transition_to(&self, next: LinkStatus) -> bool {
        matches!(
            (self, next),
            (LinkStatus::Proposed, LinkStatus::Signed)
                | (LinkStatus::Proposed, LinkStatus::Rejected)
                | (LinkStatus::Proposed, LinkStatus::Expired)
                | (LinkStatus::Signed, LinkStatus::Expired)
        )
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LinkStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LinkStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| StorageError::InvalidInput(format!("Unknown link status: {}", s)))
    }
}

/// Filter for `all_by` lookups over chunks or files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    Upload(UploadStatus),
    Download(DownloadStatus),
}

impl StatusFilter {
    /// Column the filter applies to
    pub(crate) fn column(&self) -> &'static str {
        match self {
            StatusFilter::Upload(_) => "ul_status",
            StatusFilter::Download(_) => "dl_status",
        }
    }

    /// Persisted value to match
    pub(crate) fn code(&self) -> &'static str {
        match self {
            StatusFilter::Upload(status) => status.as_code(),
            StatusFilter::Download(status) => status.as_code(),
        }
    }
}

/// How far a reconsideration propagates through the file/chunk graph.
///
/// Only top-level callers pass `Once`. The propagated calls always run with
/// `None`, so a chunk shared by thousands of files fans out exactly one
/// level and never re-enters itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cascade {
    Once,
    None,
}
