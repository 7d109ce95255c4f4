// ABOUTME: FDO compiler interface — the core treats form-definition bytes as opaque (§1 non-goals)
// ABOUTME: Defines the trait and error shape; the real compiler is an external collaborator

//! "Form definition object" byte streams describe a rendered UI form or
//! screen. The core never parses or validates FDO source or output — it
//! only forwards compiled bytes through the pacer (§1). This module defines
//! the seam the external compiler plugs into, plus a trivial pass-through
//! implementation used by tests and the demo binary.

use bytes::Bytes;

/// A structured compilation failure (§6): a message, and optionally the
/// source location and an error code the caller can match on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("FDO compilation failed: {message}")]
pub struct FdoError {
    pub message: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub code: Option<String>,
}

impl FdoError {
    pub fn new(message: impl Into<String>) -> Self {
        FdoError {
            message: message.into(),
            line: None,
            column: None,
            code: None,
        }
    }
}

/// One fragment of a streamed compilation, as delivered to the caller's sink.
#[derive(Debug, Clone)]
pub struct FdoFragment {
    pub bytes: Bytes,
    pub index: usize,
    pub is_last: bool,
}

/// The seam this core consumes but never implements for real (§1, §6): a
/// pure function from FDO source text to compiled bytes, plus a streaming
/// variant that hands fragments to a caller-supplied sink as they're ready
/// instead of buffering the whole output.
pub trait FdoCompiler: Send + Sync {
    fn compile(&self, source: &str) -> Result<Bytes, FdoError>;

    fn compile_streaming(
        &self,
        source: &str,
        max_fragment_bytes: usize,
        sink: &mut dyn FnMut(FdoFragment),
    ) -> Result<(), FdoError>;
}

/// A trivial, reentrant implementation that treats its input as already
/// being the opaque bytes to forward (no actual FDO DSL compilation). Used
/// only by tests and the demo binary; the real compiler is owned by an
/// external collaborator and is not part of this core (§1).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullFdoCompiler;

impl FdoCompiler for NullFdoCompiler {
    fn compile(&self, source: &str) -> Result<Bytes, FdoError> {
        Ok(Bytes::copy_from_slice(source.as_bytes()))
    }

    fn compile_streaming(
        &self,
        source: &str,
        max_fragment_bytes: usize,
        sink: &mut dyn FnMut(FdoFragment),
    ) -> Result<(), FdoError> {
        if max_fragment_bytes == 0 {
            return Err(FdoError::new("max_fragment_bytes must be nonzero"));
        }
        let bytes = source.as_bytes();
        let chunks: Vec<_> = bytes.chunks(max_fragment_bytes).collect();
        let last_index = chunks.len().saturating_sub(1);
        for (index, chunk) in chunks.into_iter().enumerate() {
            sink(FdoFragment {
                bytes: Bytes::copy_from_slice(chunk),
                index,
                is_last: index == last_index,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_compiler_round_trips_source_as_bytes() {
        let compiler = NullFdoCompiler;
        let out = compiler.compile("FORM hello").unwrap();
        assert_eq!(out.as_ref(), b"FORM hello");
    }

    #[test]
    fn streaming_splits_into_bounded_fragments_and_marks_the_last() {
        let compiler = NullFdoCompiler;
        let mut fragments = Vec::new();
        compiler
            .compile_streaming("0123456789", 4, &mut |frag| fragments.push(frag))
            .unwrap();

        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].bytes.as_ref(), b"0123");
        assert_eq!(fragments[1].bytes.as_ref(), b"4567");
        assert_eq!(fragments[2].bytes.as_ref(), b"89");
        assert!(!fragments[0].is_last);
        assert!(fragments[2].is_last);
    }

    #[test]
    fn streaming_rejects_a_zero_fragment_size() {
        let compiler = NullFdoCompiler;
        let mut fragments = Vec::new();
        let result = compiler.compile_streaming("x", 0, &mut |frag| fragments.push(frag));
        assert!(result.is_err());
    }
}
