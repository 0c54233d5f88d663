/// Instruction-fetch fault, distinct from a successful zero-valued read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FetchFault {
    #[error("instruction address {address:#010X} does not translate")]
    Untranslatable { address: u32 },
    #[error("instruction fetch at {address:#010X} faulted")]
    Fetch { address: u32 },
}

/// Guest memory as seen by the analyzer: instruction fetch only.
///
/// The emulator's bus implements this; tests substitute a word map. Data
/// accesses never go through here — emitted code reaches guest memory
/// through the interpreter fallback.
pub trait GuestMemory {
    fn read_u32(&mut self, address: u32) -> Result<u32, FetchFault>;
}
