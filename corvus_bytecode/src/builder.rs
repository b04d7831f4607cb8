//! Code builder for bytecode emission.
//!
//! `CodeBuilder` resolves labels to absolute instruction indices and computes
//! `max_stack` by walking the control-flow graph, so hand-written method
//! bodies (tests, bootstrap classes) do not need to count stack slots.

use crate::class_def::{CodeBody, ExceptionHandler};
use crate::descriptor::DescriptorError;
use crate::instruction::{ClassRef, Condition, Instruction};
use rustc_hash::FxHashMap;
use thiserror::Error;

/// A label for jump targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

/// Errors detected while finishing a code body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("label {0} was never bound")]
    UnboundLabel(u32),
    #[error("operand stack underflow at {0}")]
    StackUnderflow(u32),
    #[error("inconsistent stack depth at {offset}: {first} vs {second}")]
    StackMismatch { offset: u32, first: u16, second: u16 },
    #[error("control falls off the end of the code at {0}")]
    FallsOffEnd(u32),
    #[error("invalid handler range [{start}, {end})")]
    InvalidHandler { start: u32, end: u32 },
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

/// A branch whose targets are patched once labels are bound.
#[derive(Debug)]
struct Fixup {
    index: usize,
    labels: Vec<Label>,
}

#[derive(Debug)]
struct PendingHandler {
    start: Label,
    end: Label,
    handler: Label,
    catch_type: Option<ClassRef>,
}

/// Builder for method code bodies.
///
/// # Example
/// ```ignore
/// let mut b = CodeBuilder::new(1);
/// let done = b.create_label();
/// b.emit(Instruction::ILoad(0));
/// b.emit_if(Condition::Eq, done);
/// b.emit(Instruction::IConst(1));
/// b.emit(Instruction::IReturn);
/// b.bind_label(done);
/// b.emit(Instruction::IConst(0));
/// b.emit(Instruction::IReturn);
/// let code = b.finish()?;
/// ```
#[derive(Debug)]
pub struct CodeBuilder {
    max_locals: u16,
    instructions: Vec<Instruction>,
    next_label: u32,
    labels: FxHashMap<Label, u32>,
    fixups: Vec<Fixup>,
    handlers: Vec<PendingHandler>,
}

const UNRESOLVED: u32 = u32::MAX;

impl CodeBuilder {
    /// Create a builder for a method with `max_locals` local slots
    /// (parameters included).
    pub fn new(max_locals: u16) -> Self {
        Self {
            max_locals,
            instructions: Vec::new(),
            next_label: 0,
            labels: FxHashMap::default(),
            fixups: Vec::new(),
            handlers: Vec::new(),
        }
    }

    // =========================================================================
    // Labels
    // =========================================================================

    /// Create a new label for a jump target.
    pub fn create_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// Mark the current position as the target for a label.
    pub fn bind_label(&mut self, label: Label) {
        let pc = self.instructions.len() as u32;
        self.labels.insert(label, pc);
    }

    /// Current instruction offset.
    pub fn current_offset(&self) -> u32 {
        self.instructions.len() as u32
    }

    // =========================================================================
    // Instruction Emission
    // =========================================================================

    /// Emit a raw instruction.
    #[inline]
    pub fn emit(&mut self, inst: Instruction) -> &mut Self {
        self.instructions.push(inst);
        self
    }

    /// Emit several raw instructions.
    pub fn emit_all(&mut self, insts: impl IntoIterator<Item = Instruction>) -> &mut Self {
        self.instructions.extend(insts);
        self
    }

    fn emit_branch(&mut self, inst: Instruction, labels: Vec<Label>) -> &mut Self {
        self.fixups.push(Fixup {
            index: self.instructions.len(),
            labels,
        });
        self.instructions.push(inst);
        self
    }

    /// Branch comparing the int on top of stack with zero.
    pub fn emit_if(&mut self, cond: Condition, target: Label) -> &mut Self {
        self.emit_branch(Instruction::If(cond, UNRESOLVED), vec![target])
    }

    /// Branch comparing two ints.
    pub fn emit_if_icmp(&mut self, cond: Condition, target: Label) -> &mut Self {
        self.emit_branch(Instruction::IfICmp(cond, UNRESOLVED), vec![target])
    }

    pub fn emit_if_null(&mut self, target: Label) -> &mut Self {
        self.emit_branch(Instruction::IfNull(UNRESOLVED), vec![target])
    }

    pub fn emit_if_nonnull(&mut self, target: Label) -> &mut Self {
        self.emit_branch(Instruction::IfNonNull(UNRESOLVED), vec![target])
    }

    /// Branch on reference (in)equality.
    pub fn emit_if_acmp(&mut self, equal: bool, target: Label) -> &mut Self {
        let inst = if equal {
            Instruction::IfACmpEq(UNRESOLVED)
        } else {
            Instruction::IfACmpNe(UNRESOLVED)
        };
        self.emit_branch(inst, vec![target])
    }

    pub fn emit_goto(&mut self, target: Label) -> &mut Self {
        self.emit_branch(Instruction::Goto(UNRESOLVED), vec![target])
    }

    /// Dense switch over `low..low + targets.len()`.
    pub fn emit_table_switch(&mut self, low: i32, targets: &[Label], default: Label) -> &mut Self {
        let mut labels = targets.to_vec();
        labels.push(default);
        let inst = Instruction::TableSwitch {
            low,
            targets: vec![UNRESOLVED; targets.len()].into_boxed_slice(),
            default: UNRESOLVED,
        };
        self.emit_branch(inst, labels)
    }

    /// Sparse switch over explicit keys.
    pub fn emit_lookup_switch(&mut self, pairs: &[(i32, Label)], default: Label) -> &mut Self {
        let mut labels: Vec<Label> = pairs.iter().map(|&(_, l)| l).collect();
        labels.push(default);
        let inst = Instruction::LookupSwitch {
            pairs: pairs.iter().map(|&(k, _)| (k, UNRESOLVED)).collect(),
            default: UNRESOLVED,
        };
        self.emit_branch(inst, labels)
    }

    // =========================================================================
    // Exception Handlers
    // =========================================================================

    /// Protect `[start, end)` with a handler at `handler`. Handlers are
    /// matched in the order they are added.
    pub fn add_handler(
        &mut self,
        start: Label,
        end: Label,
        handler: Label,
        catch_type: Option<&str>,
    ) -> &mut Self {
        self.handlers.push(PendingHandler {
            start,
            end,
            handler,
            catch_type: catch_type.map(ClassRef::new),
        });
        self
    }

    // =========================================================================
    // Finalisation
    // =========================================================================

    fn resolve(&self, label: Label) -> Result<u32, BuildError> {
        self.labels
            .get(&label)
            .copied()
            .ok_or(BuildError::UnboundLabel(label.0))
    }

    /// Resolve labels and compute the operand stack bound.
    pub fn finish(mut self) -> Result<CodeBody, BuildError> {
        let fixups = std::mem::take(&mut self.fixups);
        for fixup in fixups {
            let targets = fixup
                .labels
                .iter()
                .map(|&l| self.resolve(l))
                .collect::<Result<Vec<_>, _>>()?;
            patch_targets(&mut self.instructions[fixup.index], &targets);
        }

        let mut handlers = Vec::with_capacity(self.handlers.len());
        for h in &self.handlers {
            let start = self.resolve(h.start)?;
            let end = self.resolve(h.end)?;
            if start >= end {
                return Err(BuildError::InvalidHandler { start, end });
            }
            handlers.push(ExceptionHandler {
                start,
                end,
                handler: self.resolve(h.handler)?,
                catch_type: h.catch_type.clone(),
            });
        }

        let max_stack = compute_max_stack(&self.instructions, &handlers)?;
        Ok(CodeBody {
            max_locals: self.max_locals,
            max_stack,
            instructions: self.instructions.into_boxed_slice(),
            handlers: handlers.into_boxed_slice(),
        })
    }
}

fn patch_targets(inst: &mut Instruction, resolved: &[u32]) {
    match inst {
        Instruction::If(_, t)
        | Instruction::IfICmp(_, t)
        | Instruction::IfNull(t)
        | Instruction::IfNonNull(t)
        | Instruction::IfACmpEq(t)
        | Instruction::IfACmpNe(t)
        | Instruction::Goto(t) => *t = resolved[0],
        Instruction::TableSwitch {
            targets, default, ..
        } => {
            let n = targets.len();
            targets.copy_from_slice(&resolved[..n]);
            *default = resolved[n];
        }
        Instruction::LookupSwitch { pairs, default } => {
            let n = pairs.len();
            for (pair, &t) in pairs.iter_mut().zip(&resolved[..n]) {
                pair.1 = t;
            }
            *default = resolved[n];
        }
        _ => {}
    }
}

/// Depth-first walk of the control-flow graph tracking operand stack depth.
fn compute_max_stack(
    instructions: &[Instruction],
    handlers: &[ExceptionHandler],
) -> Result<u16, BuildError> {
    let mut depth_at: Vec<Option<u16>> = vec![None; instructions.len()];
    let mut worklist: Vec<(u32, u16)> = vec![(0, 0)];
    let mut max = 0u16;
    let mut handlers_seeded = vec![false; handlers.len()];

    loop {
        while let Some((offset, depth)) = worklist.pop() {
            let Some(slot) = depth_at.get_mut(offset as usize) else {
                return Err(BuildError::FallsOffEnd(offset));
            };
            match *slot {
                Some(seen) if seen == depth => continue,
                Some(seen) => {
                    return Err(BuildError::StackMismatch {
                        offset,
                        first: seen,
                        second: depth,
                    });
                }
                None => *slot = Some(depth),
            }

            let inst = &instructions[offset as usize];
            let (pops, pushes) = inst.stack_effect()?;
            let after = depth
                .checked_sub(pops)
                .ok_or(BuildError::StackUnderflow(offset))?
                + pushes;
            max = max.max(after).max(depth);

            for target in inst.branch_targets() {
                worklist.push((target, after));
            }
            if inst.falls_through() {
                worklist.push((offset + 1, after));
            }
        }

        // Handlers become reachable once any protected instruction is.
        let mut seeded_any = false;
        for (i, h) in handlers.iter().enumerate() {
            if handlers_seeded[i] {
                continue;
            }
            let reachable = (h.start..h.end).any(|o| {
                depth_at
                    .get(o as usize)
                    .is_some_and(|d| d.is_some())
            });
            if reachable {
                handlers_seeded[i] = true;
                seeded_any = true;
                max = max.max(1);
                worklist.push((h.handler, 1));
            }
        }
        if !seeded_any {
            break;
        }
    }

    Ok(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_and_backward_labels() {
        let mut b = CodeBuilder::new(1);
        let top = b.create_label();
        let done = b.create_label();
        b.bind_label(top);
        b.emit(Instruction::ILoad(0));
        b.emit_if(Condition::Le, done);
        b.emit(Instruction::IInc(0, -1));
        b.emit_goto(top);
        b.bind_label(done);
        b.emit(Instruction::Return);
        let code = b.finish().unwrap();

        assert_eq!(code.instructions[1], Instruction::If(Condition::Le, 4));
        assert_eq!(code.instructions[3], Instruction::Goto(0));
        assert_eq!(code.max_stack, 1);
    }

    #[test]
    fn test_unbound_label() {
        let mut b = CodeBuilder::new(0);
        let nowhere = b.create_label();
        b.emit_goto(nowhere);
        assert_eq!(b.finish(), Err(BuildError::UnboundLabel(0)));
    }

    #[test]
    fn test_max_stack_counts_deepest_point() {
        let mut b = CodeBuilder::new(0);
        b.emit_all([
            Instruction::IConst(1),
            Instruction::IConst(2),
            Instruction::IConst(3),
            Instruction::IAdd,
            Instruction::IAdd,
            Instruction::IReturn,
        ]);
        assert_eq!(b.finish().unwrap().max_stack, 3);
    }

    #[test]
    fn test_handler_reserves_exception_slot() {
        let mut b = CodeBuilder::new(0);
        let start = b.create_label();
        let end = b.create_label();
        let handler = b.create_label();
        b.bind_label(start);
        b.emit(Instruction::Return);
        b.bind_label(end);
        b.bind_label(handler);
        b.emit(Instruction::Pop);
        b.emit(Instruction::Return);
        b.add_handler(start, end, handler, Some("lang/Throwable"));
        let code = b.finish().unwrap();

        assert_eq!(code.max_stack, 1);
        assert_eq!(code.handlers[0].handler, 1);
        assert_eq!(code.handlers[0].catch_type.as_ref().unwrap().name(), "lang/Throwable");
    }

    #[test]
    fn test_stack_mismatch_detected() {
        let mut b = CodeBuilder::new(1);
        let join = b.create_label();
        b.emit(Instruction::ILoad(0));
        b.emit_if(Condition::Eq, join);
        b.emit(Instruction::IConst(7));
        b.bind_label(join);
        b.emit(Instruction::Return);
        assert!(matches!(b.finish(), Err(BuildError::StackMismatch { .. })));
    }

    #[test]
    fn test_falls_off_end() {
        let mut b = CodeBuilder::new(0);
        b.emit(Instruction::Nop);
        assert_eq!(b.finish(), Err(BuildError::FallsOffEnd(1)));
    }
}
