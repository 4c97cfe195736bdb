//! Activation records
//!
//! Call frames live in a reference-counted arena owned by the controller,
//! addressed by opaque pointers rather than native stack slots. That is what
//! lets a call chain span workers: a forked thread's root frame chains back
//! into the forking thread's still-running frame, and a frame is only
//! reclaimed when the last path through it returns.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::instruction::SourceLoc;
use crate::value::{ArecPtr, Value, Vmid};

/// One persisted call frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationRecord {
    /// The function executing in this frame (a `FunctionPtr` value)
    pub function: Value,

    /// Thread that pushed this frame
    pub owner: Vmid,

    /// Bindings saved for this frame while a callee runs
    pub bindings: BTreeMap<String, Value>,

    /// Caller frame; crosses threads for forked calls
    pub dynamic_chain: Option<ArecPtr>,

    /// Return address for synchronous calls. Root frames (top level and
    /// forked threads) have none; returning from them finishes the thread.
    pub call_site: Option<usize>,

    /// Number of live call paths referencing this frame
    pub ref_count: i64,
}

impl ActivationRecord {
    /// Root frame of a thread. `dynamic_chain` points into the forking
    /// thread's frame when the thread was created by an async call.
    pub fn root(function: Value, owner: Vmid, dynamic_chain: Option<ArecPtr>) -> Self {
        ActivationRecord {
            function,
            owner,
            bindings: BTreeMap::new(),
            dynamic_chain,
            call_site: None,
            ref_count: 1,
        }
    }

    /// Frame for a synchronous call within one thread
    pub fn call(
        function: Value,
        owner: Vmid,
        dynamic_chain: ArecPtr,
        call_site: usize,
    ) -> Self {
        ActivationRecord {
            function,
            owner,
            bindings: BTreeMap::new(),
            dynamic_chain: Some(dynamic_chain),
            call_site: Some(call_site),
            ref_count: 1,
        }
    }

    /// Name of the function in this frame, for traces
    pub fn function_name(&self) -> &str {
        match &self.function {
            Value::FunctionPtr { name, .. } => name,
            Value::ForeignPtr { name, .. } => name,
            _ => "<unknown>",
        }
    }
}

/* ===================== Stack traces ===================== */

/// One frame of a reconstructed stack trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceFrame {
    pub thread: Vmid,
    pub function: String,
    pub call_site: Option<usize>,
    pub loc: Option<SourceLoc>,
}

/// Render a caller-first trace for diagnostics
pub fn render_trace(frames: &[TraceFrame]) -> String {
    let mut out = String::new();
    for frame in frames {
        out.push_str(&format!("  thread {} in {}", frame.thread, frame.function));
        if let Some(loc) = &frame.loc {
            out.push_str(&format!(" at {}:{} ({})", loc.file, loc.line, loc.text));
        } else if let Some(site) = frame.call_site {
            out.push_str(&format!(" at offset {site}"));
        }
        out.push('\n');
    }
    out
}
