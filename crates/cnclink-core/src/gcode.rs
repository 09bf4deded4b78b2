//! Instruction values accepted by the submission interfaces
//!
//! The controller layer never parses G-code itself: a [`GcodeInstruction`] is
//! an opaque tagged value produced upstream, carrying the raw line text and
//! optionally a hook bundle for lifecycle observation.

use crate::lifecycle::InstructionHooks;
use std::sync::Arc;
use uuid::Uuid;

/// An opaque, tagged G-code instruction
///
/// Identified by a v4 UUID for the duration of its flight. The hook bundle,
/// when present, is shared with the controller until the instruction reaches
/// a terminal lifecycle event.
#[derive(Clone)]
pub struct GcodeInstruction {
    id: Uuid,
    text: String,
    hooks: Option<Arc<dyn InstructionHooks>>,
}

impl GcodeInstruction {
    /// Create an instruction from its raw line text (no trailing newline)
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            hooks: None,
        }
    }

    /// Attach a hook bundle
    pub fn with_hooks(mut self, hooks: Arc<dyn InstructionHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Unique identifier of this instruction
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Raw line text
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The attached hook bundle, if any
    pub fn hooks(&self) -> Option<Arc<dyn InstructionHooks>> {
        self.hooks.clone()
    }

    /// Split into the raw text and the hook bundle
    pub fn into_parts(self) -> (Uuid, String, Option<Arc<dyn InstructionHooks>>) {
        (self.id, self.text, self.hooks)
    }
}

impl std::fmt::Debug for GcodeInstruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcodeInstruction")
            .field("id", &self.id)
            .field("text", &self.text)
            .field("has_hooks", &self.hooks.is_some())
            .finish()
    }
}

/// Anything the submission interfaces accept: a raw line or a tagged
/// instruction
#[derive(Debug, Clone)]
pub enum SendItem {
    /// Raw textual line, no trailing newline, no lifecycle hooks
    Line(String),
    /// Structured instruction, possibly carrying hooks
    Instruction(GcodeInstruction),
}

impl SendItem {
    /// The raw line text either variant carries
    pub fn text(&self) -> &str {
        match self {
            SendItem::Line(line) => line,
            SendItem::Instruction(instr) => instr.text(),
        }
    }
}

impl From<String> for SendItem {
    fn from(line: String) -> Self {
        SendItem::Line(line)
    }
}

impl From<&str> for SendItem {
    fn from(line: &str) -> Self {
        SendItem::Line(line.to_string())
    }
}

impl From<GcodeInstruction> for SendItem {
    fn from(instr: GcodeInstruction) -> Self {
        SendItem::Instruction(instr)
    }
}
