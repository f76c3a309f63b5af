//! Bucket: the directory an envelope currently lives in.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::EnvelopeStatus;

/// The four envelope directories. The directory an envelope file is in is
/// its authoritative status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl Bucket {
    pub const ALL: [Bucket; 4] = [
        Bucket::Pending,
        Bucket::Processing,
        Bucket::Completed,
        Bucket::Failed,
    ];

    pub fn dir_name(self) -> &'static str {
        match self {
            Bucket::Pending => "pending",
            Bucket::Processing => "processing",
            Bucket::Completed => "completed",
            Bucket::Failed => "failed",
        }
    }

    /// Status written into a record when it lands in this bucket.
    pub fn status(self) -> EnvelopeStatus {
        match self {
            Bucket::Pending => EnvelopeStatus::Pending,
            Bucket::Processing => EnvelopeStatus::Processing,
            Bucket::Completed => EnvelopeStatus::Completed,
            Bucket::Failed => EnvelopeStatus::Failed,
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}
