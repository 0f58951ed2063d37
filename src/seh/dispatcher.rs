//! The fault/resume state machine.
//!
//! ```text
//!            dispatch()                    return_from_handler() [EAX = 0]
//! Running ──────────────► HandlerActive ─────────────────────────────────► Running
//!                            │   ▲  │
//!                  dispatch()│   │  │ return_from_handler() [EAX != 0]
//!                  (nested)  └───┘  └──────────────────────────────────► Fatal
//! ```
//!
//! # Dispatch frame
//!
//! The dispatcher carves `0x3C8` bytes below the faulting `ESP` and lays them out as:
//!
//! | Offset   | Content                                             |
//! |----------|-----------------------------------------------------|
//! | `-0x10`  | pushed arguments: trampoline, record, frame, context |
//! | `+0x14`  | synthetic SEH frame (previous, three poison dwords)   |
//! | `+0xE8`  | `EXCEPTION_RECORD` header                             |
//! | `+0xFC`  | `CONTEXT`, ending at the faulting `ESP`               |
//!
//! # Nesting
//!
//! A fault raised while a handler runs is dispatched like any other. The chain head is then a
//! synthetic frame whose handler slot holds poison, so the dispatcher skips synthetic frames
//! and calls the first guest-registered handler behind them. Nesting depth is not bounded:
//! a handler that keeps faulting walks down the emulated stack `0x3D8` bytes per fault until
//! the stack is exhausted.

use log::info;

use crate::{
    cpu::{CpuState, Register},
    memory::GuestMemory,
    process::structs::{self, dispatch_frame, nt_tib, seh_frame},
    seh::{
        chain::{self, SehChain},
        context,
        frame::{FrameKind, SehFrame},
        record::ExceptionRecord,
        HandlerDisposition,
    },
    utils::io::read_le_field,
    Error, Result,
};

/// State of the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum DispatchState {
    /// Guest code runs normally.
    Running,
    /// At least one guest handler is executing.
    HandlerActive,
    /// A handler returned an unsupported disposition; nothing more can be dispatched.
    Fatal,
}

/// Bookkeeping for one handler invocation.
#[derive(Clone, Copy, Debug)]
struct ActiveDispatch {
    synthetic_frame: u32,
    context: u32,
    code: u32,
}

/// SEH dispatcher for one thread.
#[derive(Debug)]
pub struct SehDispatcher {
    tib: u32,
    return_trampoline: u32,
    max_hops: usize,
    dump_chain: bool,
    state: DispatchState,
    active: Vec<ActiveDispatch>,
    fault_count: u64,
}

impl SehDispatcher {
    /// Creates a dispatcher for the thread block at `tib`.
    ///
    /// # Arguments
    ///
    /// * `tib` - Address of the thread information block
    /// * `return_trampoline` - Return address pushed for guest handlers
    /// * `max_hops` - Hop limit for chain walks
    /// * `dump_chain` - Whether to log the chain after dispatch and resume
    #[must_use]
    pub fn new(tib: u32, return_trampoline: u32, max_hops: usize, dump_chain: bool) -> Self {
        Self {
            tib,
            return_trampoline,
            max_hops,
            dump_chain,
            state: DispatchState::Running,
            active: Vec::new(),
            fault_count: 0,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// Number of faults dispatched so far.
    #[must_use]
    pub fn fault_count(&self) -> u64 {
        self.fault_count
    }

    /// Number of handlers currently executing.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.active.len()
    }

    /// Exception code of the innermost active dispatch.
    #[must_use]
    pub fn active_code(&self) -> Option<u32> {
        self.active.last().map(|a| a.code)
    }

    /// Addresses of the synthetic frames currently on the chain.
    #[must_use]
    pub fn synthetic_frames(&self) -> Vec<u32> {
        self.active.iter().map(|a| a.synthetic_frame).collect()
    }

    /// Turns the pending fault `code` into a call of the guest handler.
    ///
    /// Returns the handler address, which is also loaded into `EIP`.
    ///
    /// # Errors
    ///
    /// - [`Error::ProcessHalted`] if the dispatcher is in the fatal state
    /// - [`Error::UnhandledException`] if no readable guest frame heads the chain
    /// - Any guest memory error while building the dispatch frame
    pub fn dispatch<C, M>(&mut self, cpu: &mut C, memory: &M, code: u32) -> Result<u32>
    where
        C: CpuState + ?Sized,
        M: GuestMemory + ?Sized,
    {
        if self.state == DispatchState::Fatal {
            return Err(Error::ProcessHalted);
        }

        let eip = cpu.reg(Register::Eip);
        info!("Exception 0x{:08X} at 0x{:08X} ({})", code, eip, self.fault_count);

        let base = cpu.reg(Register::Esp).wrapping_sub(dispatch_frame::SIZE);
        let record_address = base.wrapping_add(dispatch_frame::EXCEPTION_RECORD);
        let context_address = base.wrapping_add(dispatch_frame::CONTEXT);
        let synthetic_address = base.wrapping_add(dispatch_frame::SYNTHETIC_FRAME);
        let arguments_address = base.wrapping_sub(dispatch_frame::ARGUMENTS_SIZE);

        let head_field = u64::from(self.tib + nt_tib::EXCEPTION_LIST);
        let head = memory.read_u32(head_field)?;
        let frame = self.handler_frame(memory, head)?.ok_or(Error::UnhandledException {
            code,
            address: eip,
        })?;
        info!(
            "seh_ptr 0x{:08X} {{ old_seh 0x{:08X} eh 0x{:08X} }} ctx_addr 0x{:08X}",
            frame.address, frame.previous, frame.handler, context_address
        );

        // Guest memory first; CPU and dispatcher state only once every write has landed.
        context::save(cpu, memory, context_address)?;
        ExceptionRecord::new(code, eip).write(memory, record_address)?;

        let mut arguments = Vec::with_capacity(dispatch_frame::ARGUMENTS_SIZE as usize);
        for value in [self.return_trampoline, record_address, frame.address, context_address] {
            arguments.extend_from_slice(&value.to_le_bytes());
        }
        memory.write(u64::from(arguments_address), &arguments)?;

        let synthetic = SehFrame {
            address: synthetic_address,
            previous: head,
            handler: dispatch_frame::POISON[0],
            kind: FrameKind::Synthetic,
        };
        synthetic.write(memory)?;
        let mut trailer = Vec::with_capacity(8);
        for poison in &dispatch_frame::POISON[1..] {
            trailer.extend_from_slice(&poison.to_le_bytes());
        }
        memory.write(u64::from(synthetic_address + seh_frame::SIZE), &trailer)?;
        memory.write_u32(head_field, synthetic_address)?;
        info!("Fake seh ad 0x{synthetic_address:08X}");

        self.active.push(ActiveDispatch {
            synthetic_frame: synthetic_address,
            context: context_address,
            code,
        });
        self.state = DispatchState::HandlerActive;
        self.fault_count += 1;
        cpu.set_reg(Register::Esp, arguments_address);
        cpu.set_reg(Register::Eip, frame.handler);

        self.dump(memory);
        memory.clear_exception();
        cpu.clear_exception();

        info!("Jumping at 0x{:08X}", frame.handler);
        Ok(frame.handler)
    }

    /// Completes a handler invocation. Call when execution reaches the return trampoline.
    ///
    /// Restores the chain head and `ESP`, then applies the disposition in `EAX`.
    ///
    /// # Errors
    ///
    /// - [`Error::ProcessHalted`] if the dispatcher is in the fatal state
    /// - [`Error::NoActiveException`] if no handler is executing
    /// - [`Error::UnsupportedDisposition`] for any disposition but continue-execution; the
    ///   dispatcher enters [`DispatchState::Fatal`]
    /// - Any guest memory error while reading the dispatch frame
    pub fn return_from_handler<C, M>(&mut self, cpu: &mut C, memory: &M) -> Result<()>
    where
        C: CpuState + ?Sized,
        M: GuestMemory + ?Sized,
    {
        if self.state == DispatchState::Fatal {
            return Err(Error::ProcessHalted);
        }
        let Some(active) = self.active.last().copied() else {
            return Err(Error::NoActiveException);
        };

        // Every read happens before anything is committed, so a failed call can be retried.
        let esp = cpu.reg(Register::Esp);
        let context_address =
            memory.read_u32(u64::from(esp.wrapping_add(dispatch_frame::CONTEXT_ARGUMENT)))?;
        if context_address != active.context {
            info!(
                "Handler context 0x{:08X} differs from dispatched context 0x{:08X}",
                context_address, active.context
            );
        }
        info!("Context address: 0x{context_address:08X}");

        let record = memory.read(u64::from(context_address), structs::context::SIZE as usize)?;
        let saved_esp: u32 = read_le_field(&record, structs::context::ESP as usize)?;
        let head_field = u64::from(self.tib + nt_tib::EXCEPTION_LIST);
        let current = memory.read_u32(head_field)?;
        let previous = memory.read_u32(u64::from(current + seh_frame::PREVIOUS))?;

        memory.write_u32(head_field, previous)?;
        info!("Old seh: 0x{current:08X} New seh: 0x{previous:08X}");
        self.active.pop();

        cpu.set_reg(Register::Esp, saved_esp);
        info!("New esp: 0x{saved_esp:08X}");

        self.state = if self.active.is_empty() {
            DispatchState::Running
        } else {
            DispatchState::HandlerActive
        };
        self.dump(memory);

        match HandlerDisposition::from_raw(cpu.reg(Register::Eax)) {
            HandlerDisposition::ContinueExecution => {
                info!("Seh continues Context: 0x{context_address:08X}");
                context::apply(&record, cpu)?;
                info!("Context::Eip: 0x{:08X}", cpu.reg(Register::Eip));
                Ok(())
            }
            disposition => {
                self.state = DispatchState::Fatal;
                Err(Error::UnsupportedDisposition(disposition))
            }
        }
    }

    /// Walks the chain, tagging the frames this dispatcher installed.
    #[must_use]
    pub fn chain<M: GuestMemory + ?Sized>(&self, memory: &M) -> SehChain {
        chain::walk(memory, self.tib, self.max_hops, &self.synthetic_frames())
    }

    /// Finds the frame whose handler receives the fault: the head, or the first frame behind
    /// the synthetic frames of enclosing dispatches.
    fn handler_frame<M: GuestMemory + ?Sized>(
        &self,
        memory: &M,
        head: u32,
    ) -> Result<Option<SehFrame>> {
        let mut address = head;
        for _ in 0..=self.active.len() {
            if !memory.is_readable(u64::from(address), seh_frame::SIZE as usize) {
                return Ok(None);
            }
            if self.active.iter().any(|a| a.synthetic_frame == address) {
                address = memory.read_u32(u64::from(address + seh_frame::PREVIOUS))?;
                continue;
            }
            return SehFrame::read(memory, address, FrameKind::Real).map(Some);
        }
        Ok(None)
    }

    fn dump<M: GuestMemory + ?Sized>(&self, memory: &M) {
        if self.dump_chain {
            self.chain(memory);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cpu::RegisterFile,
        memory::{AddressSpace, MemoryProtection},
        process::LayoutPlan,
        seh::ChainEnd,
    };

    const TIB: u32 = 0x7FF7_0000;
    const TRAMPOLINE: u32 = 0x6EAD_BEEF;
    const STACK_TOP: u32 = 0x0013_0000;
    const ESP: u32 = 0x0012_FF00;
    const GUEST_FRAME: u32 = 0x0012_FF80;
    const HANDLER: u32 = 0x0040_2000;

    fn setup() -> (AddressSpace, RegisterFile, SehDispatcher) {
        let memory = AddressSpace::new();
        memory
            .map(u64::from(TIB), MemoryProtection::READ_WRITE, &GUEST_FRAME.to_le_bytes(), "tib")
            .unwrap();
        memory
            .map(0x0012_0000, MemoryProtection::READ_WRITE, &vec![0; 0x1_0000], "stack")
            .unwrap();
        memory.write_u32(u64::from(GUEST_FRAME), 0xFFFF_FFFF).unwrap();
        memory.write_u32(u64::from(GUEST_FRAME) + 4, HANDLER).unwrap();

        let mut cpu = RegisterFile::new();
        cpu.set_reg(Register::Esp, ESP);
        cpu.set_reg(Register::Eip, 0x0040_1010);
        cpu.set_reg(Register::Ebx, 0x1234);

        assert!(STACK_TOP > GUEST_FRAME);
        (memory, cpu, SehDispatcher::new(TIB, TRAMPOLINE, 5, true))
    }

    /// Simulates the handler's `ret`: pops the trampoline into `EIP`.
    fn handler_returns(cpu: &mut RegisterFile, memory: &AddressSpace, eax: u32) {
        let esp = cpu.reg(Register::Esp);
        let target = memory.read_u32(u64::from(esp)).unwrap();
        assert_eq!(target, TRAMPOLINE);
        cpu.set_reg(Register::Esp, esp + 4);
        cpu.set_reg(Register::Eip, target);
        cpu.set_reg(Register::Eax, eax);
    }

    #[test]
    fn dispatch_builds_frame() {
        let (memory, mut cpu, mut dispatcher) = setup();
        cpu.raise_exception(0xC000_0005);

        let handler = dispatcher.dispatch(&mut cpu, &memory, 0xC000_0005).unwrap();
        assert_eq!(handler, HANDLER);
        assert_eq!(cpu.reg(Register::Eip), HANDLER);
        assert_eq!(cpu.pending_exception(), 0);
        assert_eq!(dispatcher.state(), DispatchState::HandlerActive);
        assert_eq!(dispatcher.fault_count(), 1);

        let base = ESP - 0x3C8;
        let esp = cpu.reg(Register::Esp);
        assert_eq!(esp, base - 0x10);
        assert_eq!(memory.read_u32(u64::from(esp)).unwrap(), TRAMPOLINE);
        assert_eq!(memory.read_u32(u64::from(esp + 4)).unwrap(), base + 0xE8);
        assert_eq!(memory.read_u32(u64::from(esp + 8)).unwrap(), GUEST_FRAME);
        assert_eq!(memory.read_u32(u64::from(esp + 12)).unwrap(), base + 0xFC);

        assert_eq!(memory.read_u32(u64::from(TIB)).unwrap(), base + 0x14);
        assert_eq!(memory.read_u32(u64::from(base + 0x14)).unwrap(), GUEST_FRAME);
        assert_eq!(memory.read_u32(u64::from(base + 0x18)).unwrap(), 0xAAAA_AAAA);
        assert_eq!(memory.read_u32(u64::from(base + 0x1C)).unwrap(), 0xAAAA_AABB);
        assert_eq!(memory.read_u32(u64::from(base + 0x20)).unwrap(), 0xAAAA_AACC);

        let record = ExceptionRecord::read(&memory, base + 0xE8).unwrap();
        assert_eq!(record, ExceptionRecord::new(0xC000_0005, 0x0040_1010));

        let walked = dispatcher.chain(&memory);
        assert_eq!(walked.frames[0].kind, FrameKind::Synthetic);
        assert_eq!(walked.frames[1].address, GUEST_FRAME);
    }

    #[test]
    fn continue_execution_resumes() {
        let (memory, mut cpu, mut dispatcher) = setup();
        dispatcher.dispatch(&mut cpu, &memory, 0xC000_0094).unwrap();

        cpu.set_reg(Register::Ebx, 0xBAD);
        handler_returns(&mut cpu, &memory, 0);
        dispatcher.return_from_handler(&mut cpu, &memory).unwrap();

        assert_eq!(cpu.reg(Register::Esp), ESP);
        assert_eq!(cpu.reg(Register::Eip), 0x0040_1010);
        assert_eq!(cpu.reg(Register::Ebx), 0x1234);
        assert_eq!(cpu.reg(Register::Eax), 0);
        assert_eq!(memory.read_u32(u64::from(TIB)).unwrap(), GUEST_FRAME);
        assert_eq!(dispatcher.state(), DispatchState::Running);
    }

    #[test]
    fn handler_edits_to_context_are_applied() {
        let (memory, mut cpu, mut dispatcher) = setup();
        dispatcher.dispatch(&mut cpu, &memory, 0xC000_0005).unwrap();

        // Skip the faulting instruction, as guest handlers commonly do.
        let context_address = ESP - 0x3C8 + 0xFC;
        memory
            .write_u32(u64::from(context_address + 0xB8), 0x0040_1012)
            .unwrap();

        handler_returns(&mut cpu, &memory, 0);
        dispatcher.return_from_handler(&mut cpu, &memory).unwrap();
        assert_eq!(cpu.reg(Register::Eip), 0x0040_1012);
    }

    #[test]
    fn unsupported_dispositions_halt() {
        for eax in [1, 0xFFFF_FFFF, 2, 0x42] {
            let (memory, mut cpu, mut dispatcher) = setup();
            dispatcher.dispatch(&mut cpu, &memory, 0xC000_0005).unwrap();
            handler_returns(&mut cpu, &memory, eax);

            let err = dispatcher.return_from_handler(&mut cpu, &memory).unwrap_err();
            assert!(matches!(
                err,
                Error::UnsupportedDisposition(d) if d == HandlerDisposition::from_raw(eax)
            ));
            assert_eq!(dispatcher.state(), DispatchState::Fatal);
            // The chain head is restored before the disposition is looked at.
            assert_eq!(memory.read_u32(u64::from(TIB)).unwrap(), GUEST_FRAME);

            assert!(matches!(
                dispatcher.dispatch(&mut cpu, &memory, 0xC000_0005),
                Err(Error::ProcessHalted)
            ));
            assert!(matches!(
                dispatcher.return_from_handler(&mut cpu, &memory),
                Err(Error::ProcessHalted)
            ));
        }
    }

    #[test]
    fn return_without_dispatch() {
        let (memory, mut cpu, mut dispatcher) = setup();
        assert!(matches!(
            dispatcher.return_from_handler(&mut cpu, &memory),
            Err(Error::NoActiveException)
        ));
    }

    #[test]
    fn sentinel_head_is_unhandled() {
        let (memory, mut cpu, mut dispatcher) = setup();
        memory
            .write_u32(u64::from(TIB), LayoutPlan::default().default_seh)
            .unwrap();

        assert!(matches!(
            dispatcher.dispatch(&mut cpu, &memory, 0x8000_0003),
            Err(Error::UnhandledException {
                code: 0x8000_0003,
                address: 0x0040_1010
            })
        ));
        assert_eq!(dispatcher.fault_count(), 0);
        assert_eq!(cpu.reg(Register::Esp), ESP);
    }

    #[test]
    fn nested_fault_skips_synthetic_frame() {
        let (memory, mut cpu, mut dispatcher) = setup();
        dispatcher.dispatch(&mut cpu, &memory, 0xC000_0005).unwrap();
        let outer_esp = cpu.reg(Register::Esp);

        // The handler faults before returning.
        cpu.set_reg(Register::Eip, HANDLER + 4);
        let handler = dispatcher.dispatch(&mut cpu, &memory, 0xC000_001D).unwrap();
        assert_eq!(handler, HANDLER);
        assert_eq!(dispatcher.depth(), 2);
        assert_eq!(dispatcher.active_code(), Some(0xC000_001D));

        handler_returns(&mut cpu, &memory, 0);
        dispatcher.return_from_handler(&mut cpu, &memory).unwrap();
        assert_eq!(cpu.reg(Register::Esp), outer_esp);
        assert_eq!(cpu.reg(Register::Eip), HANDLER + 4);
        assert_eq!(dispatcher.state(), DispatchState::HandlerActive);

        handler_returns(&mut cpu, &memory, 0);
        dispatcher.return_from_handler(&mut cpu, &memory).unwrap();
        assert_eq!(cpu.reg(Register::Esp), ESP);
        assert_eq!(memory.read_u32(u64::from(TIB)).unwrap(), GUEST_FRAME);
        assert_eq!(dispatcher.state(), DispatchState::Running);
        assert_eq!(dispatcher.fault_count(), 2);
    }

    #[test]
    fn unreadable_outer_frame_does_not_fail_dispatch() {
        let (memory, mut cpu, mut dispatcher) = setup();
        memory
            .map(0x0050_0000, MemoryProtection::EXECUTE, &[0; 8], "code")
            .unwrap();
        memory.write_u32(u64::from(GUEST_FRAME), 0x0050_0000).unwrap();

        assert_eq!(dispatcher.dispatch(&mut cpu, &memory, 0xC000_0005).unwrap(), HANDLER);
        assert_eq!(memory.pending_exception(), 0);

        let walked = dispatcher.chain(&memory);
        assert_eq!(walked.frames.len(), 2);
        assert_eq!(walked.end, ChainEnd::Unreadable(0x0050_0000));
        assert_eq!(memory.pending_exception(), 0);
    }

    #[test]
    fn failed_dispatch_commits_nothing() {
        let (memory, mut cpu, mut dispatcher) = setup();
        // The dispatch frame would start below the mapped stack.
        cpu.set_reg(Register::Esp, 0x0012_0100);

        assert!(dispatcher.dispatch(&mut cpu, &memory, 0xC000_0005).is_err());
        assert_eq!(dispatcher.state(), DispatchState::Running);
        assert_eq!(dispatcher.depth(), 0);
        assert_eq!(dispatcher.fault_count(), 0);
        assert_eq!(cpu.reg(Register::Esp), 0x0012_0100);
        assert_eq!(cpu.reg(Register::Eip), 0x0040_1010);
        assert_eq!(memory.read_u32(u64::from(TIB)).unwrap(), GUEST_FRAME);
    }

    #[test]
    fn failed_return_can_be_retried() {
        let (memory, mut cpu, mut dispatcher) = setup();
        dispatcher.dispatch(&mut cpu, &memory, 0xC000_0005).unwrap();
        let synthetic = memory.read_u32(u64::from(TIB)).unwrap();
        handler_returns(&mut cpu, &memory, 0);
        let esp = cpu.reg(Register::Esp);

        cpu.set_reg(Register::Esp, 0x0900_0000);
        assert!(matches!(
            dispatcher.return_from_handler(&mut cpu, &memory),
            Err(Error::InvalidAddress { .. })
        ));
        assert_eq!(dispatcher.state(), DispatchState::HandlerActive);
        assert_eq!(dispatcher.depth(), 1);
        assert_eq!(memory.read_u32(u64::from(TIB)).unwrap(), synthetic);

        cpu.set_reg(Register::Esp, esp);
        dispatcher.return_from_handler(&mut cpu, &memory).unwrap();
        assert_eq!(dispatcher.state(), DispatchState::Running);
        assert_eq!(memory.read_u32(u64::from(TIB)).unwrap(), GUEST_FRAME);
        assert_eq!(cpu.reg(Register::Esp), ESP);
    }
}
