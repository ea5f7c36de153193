use std::io;

use thiserror::Error;

/// Errors that can occur while building an execution context.
#[derive(Debug, Error)]
pub enum Error {
    /// The operating system refused to provide memory for a stack.
    #[error("failed to allocate a {size} byte stack")]
    ResourceExhausted {
        /// Requested usable stack size in bytes.
        size: usize,
        /// Error reported by the allocator.
        #[source]
        source: io::Error,
    },

    /// The requested stack size cannot be represented once guard pages and
    /// page rounding are added.
    #[error("stack size {size} overflows the address space")]
    StackSizeOverflow {
        /// Requested usable stack size in bytes.
        size: usize,
    },
}

impl Error {
    pub(crate) fn exhausted(size: usize) -> Self {
        Error::ResourceExhausted {
            size,
            source: io::Error::last_os_error(),
        }
    }
}
