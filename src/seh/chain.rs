//! Read-only traversal of the SEH chain.
//!
//! The walk starts at `NtTib.ExceptionList` and follows `previous` links until one of:
//!
//! - a frame is not mapped for its full eight bytes
//! - a frame is mapped but cannot be read
//! - a `previous` link is zero
//! - more than the configured number of links have been followed
//!
//! The hop limit makes the walk terminate on cyclic chains. Ending the walk early is never an
//! error; [`SehChain::end`] records why it stopped. The walk checks readability before it reads, so it
//! never leaves a pending fault in guest memory.

use log::{info, warn};

use crate::{
    memory::GuestMemory,
    process::structs::{nt_tib, seh_frame},
    seh::frame::{FrameKind, SehFrame},
};

/// Why a chain walk stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainEnd {
    /// A frame's `previous` link was zero.
    Terminated,
    /// The next frame address was not mapped for eight bytes.
    Unmapped(u32),
    /// The next frame was mapped but not readable.
    Unreadable(u32),
    /// The hop limit was exceeded.
    HopLimit,
}

/// Result of a chain walk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SehChain {
    /// Frames in visiting order, starting with the chain head.
    pub frames: Vec<SehFrame>,
    /// Why the walk stopped.
    pub end: ChainEnd,
}

impl SehChain {
    /// Handler of the first guest-registered frame, if the walk saw one.
    #[must_use]
    pub fn first_real_handler(&self) -> Option<u32> {
        self.frames
            .iter()
            .find(|f| f.kind == FrameKind::Real)
            .map(|f| f.handler)
    }
}

/// Walks the chain of the thread block at `tib`, logging every frame.
///
/// Frames whose address appears in `synthetic` are tagged [`FrameKind::Synthetic`].
pub fn walk<M: GuestMemory + ?Sized>(
    memory: &M,
    tib: u32,
    max_hops: usize,
    synthetic: &[u32],
) -> SehChain {
    info!("Dump_seh. Tib_address: 0x{tib:08X}");

    let head_field = tib + nt_tib::EXCEPTION_LIST;
    let head = if memory.is_readable(u64::from(head_field), 4) {
        memory.read_u32(u64::from(head_field)).ok()
    } else {
        None
    };
    let Some(mut current) = head else {
        return SehChain {
            frames: Vec::new(),
            end: ChainEnd::Unmapped(head_field),
        };
    };

    let mut frames = Vec::new();
    let mut hops = 0;

    let end = loop {
        if hops > max_hops {
            warn!("Too many seh, quit");
            break ChainEnd::HopLimit;
        }
        if !memory.is_mapped(u64::from(current), seh_frame::SIZE as usize) {
            break ChainEnd::Unmapped(current);
        }
        if !memory.is_readable(u64::from(current), seh_frame::SIZE as usize) {
            warn!("seh_ptr 0x{current:08X} is not readable");
            break ChainEnd::Unreadable(current);
        }

        let kind = if synthetic.contains(&current) {
            FrameKind::Synthetic
        } else {
            FrameKind::Real
        };
        let Ok(frame) = SehFrame::read(memory, current, kind) else {
            break ChainEnd::Unreadable(current);
        };
        info!("{}{}", "\t".repeat(hops + 1), frame);
        frames.push(frame);

        if frame.previous == 0 {
            break ChainEnd::Terminated;
        }
        current = frame.previous;
        hops += 1;
    };

    SehChain { frames, end }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AddressSpace, MemoryProtection};

    const TIB: u32 = 0x7FF7_0000;

    fn chain(frames: &[(u32, u32, u32)], head: u32) -> AddressSpace {
        let memory = AddressSpace::new();
        memory
            .map(u64::from(TIB), MemoryProtection::READ_WRITE, &head.to_le_bytes(), "tib")
            .unwrap();
        for (address, previous, handler) in frames {
            let mut data = previous.to_le_bytes().to_vec();
            data.extend_from_slice(&handler.to_le_bytes());
            memory
                .map(u64::from(*address), MemoryProtection::READ_WRITE, &data, "frame")
                .unwrap();
        }
        memory
    }

    #[test]
    fn ends_on_zero_link() {
        let memory = chain(&[(0x1000, 0x2000, 0x11), (0x2000, 0, 0x22)], 0x1000);
        let walked = walk(&memory, TIB, 5, &[]);

        assert_eq!(walked.end, ChainEnd::Terminated);
        assert_eq!(walked.frames.len(), 2);
        assert_eq!(walked.frames[1].handler, 0x22);
    }

    #[test]
    fn ends_on_unmapped_frame() {
        let memory = chain(&[(0x1000, 0xFFFF_FFFF, 0x11)], 0x1000);
        let walked = walk(&memory, TIB, 5, &[]);

        assert_eq!(walked.end, ChainEnd::Unmapped(0xFFFF_FFFF));
        assert_eq!(walked.frames.len(), 1);
        assert_eq!(memory.pending_exception(), 0);
    }

    #[test]
    fn default_sentinel_head_has_no_frames() {
        let memory = chain(&[], 0x7FFF_F000);
        let walked = walk(&memory, TIB, 5, &[]);
        assert_eq!(walked.end, ChainEnd::Unmapped(0x7FFF_F000));
        assert!(walked.frames.is_empty());
    }

    #[test]
    fn self_referencing_chain_terminates() {
        let memory = chain(&[(0x1000, 0x1000, 0x11)], 0x1000);
        let walked = walk(&memory, TIB, 5, &[]);

        assert_eq!(walked.end, ChainEnd::HopLimit);
        assert_eq!(walked.frames.len(), 6);
    }

    #[test]
    fn synthetic_frames_are_tagged() {
        let memory = chain(&[(0x1000, 0x2000, 0xAAAA_AAAA), (0x2000, 0, 0x22)], 0x1000);
        let walked = walk(&memory, TIB, 5, &[0x1000]);

        assert_eq!(walked.frames[0].kind, FrameKind::Synthetic);
        assert_eq!(walked.frames[1].kind, FrameKind::Real);
        assert_eq!(walked.first_real_handler(), Some(0x22));
    }

    #[test]
    fn ends_on_undersized_frame() {
        let memory = chain(&[(0x1000, 0x3000, 0x11)], 0x1000);
        memory
            .map(0x3000, MemoryProtection::READ_WRITE, &0u32.to_le_bytes(), "short")
            .unwrap();

        let walked = walk(&memory, TIB, 5, &[]);
        assert_eq!(walked.end, ChainEnd::Unmapped(0x3000));
        assert_eq!(walked.frames.len(), 1);
        assert_eq!(memory.pending_exception(), 0);
    }

    #[test]
    fn ends_on_unreadable_frame() {
        let memory = chain(&[(0x1000, 0x3000, 0x11)], 0x1000);
        memory
            .map(0x3000, MemoryProtection::EXECUTE, &[0; 8], "code")
            .unwrap();

        let walked = walk(&memory, TIB, 5, &[]);
        assert_eq!(walked.end, ChainEnd::Unreadable(0x3000));
        assert_eq!(walked.frames.len(), 1);
        assert_eq!(memory.pending_exception(), 0);
    }

    #[test]
    fn unmapped_thread_block() {
        let memory = AddressSpace::new();
        let walked = walk(&memory, TIB, 5, &[]);
        assert_eq!(walked.end, ChainEnd::Unmapped(TIB));
        assert!(walked.frames.is_empty());
    }
}
