// src/op.rs
//
// Operation tags and the stat class a finished handler reports.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Server-side copy between remote objects.
    Copy,
    /// Remote multi-key delete.
    Delete,
    /// Remote object to local file.
    Download,
    /// Local file to remote object.
    Upload,
    LocalCopy,
    LocalDelete,
    /// Listing of a remote prefix or pattern.
    List,
    ListBuckets,
    /// Size/count aggregation grouped by storage class.
    Size,
    /// Metadata of a single remote object.
    Head,
    /// Stream a remote object to stdout.
    Cat,
    BatchDownload,
    BatchCopy,
    BatchDelete,
    BatchLocalDelete,
    /// Arm abort-on-error for the rest of the stream.
    AbortOnError,
    /// Run the remainder of the line through a subshell.
    ShellExec,
    /// Terminate the stream with an explicit exit code.
    Exit,
}

impl Operation {
    /// Control verbs produce no user-visible output line.
    pub fn is_internal(self) -> bool {
        matches!(self, Operation::AbortOnError | Operation::Exit)
    }

    /// Batch variants run through the wildcard coordinator.
    pub fn is_batch(self) -> bool {
        matches!(
            self,
            Operation::BatchDownload
                | Operation::BatchCopy
                | Operation::BatchDelete
                | Operation::BatchLocalDelete
        )
    }

    /// The batch variant a wildcard source promotes this operation to.
    pub fn batch_variant(self) -> Option<Operation> {
        match self {
            Operation::Copy => Some(Operation::BatchCopy),
            Operation::Download => Some(Operation::BatchDownload),
            Operation::Delete => Some(Operation::BatchDelete),
            Operation::LocalDelete => Some(Operation::BatchLocalDelete),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The class of work a handler performed, for the stats service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    S3Op,
    FileOp,
    ShellOp,
    Fail,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_promotion() {
        assert_eq!(Operation::Copy.batch_variant(), Some(Operation::BatchCopy));
        assert_eq!(
            Operation::LocalDelete.batch_variant(),
            Some(Operation::BatchLocalDelete)
        );
        assert_eq!(Operation::Upload.batch_variant(), None);
        assert!(Operation::BatchCopy.is_batch());
        assert!(Operation::Exit.is_internal());
    }
}
