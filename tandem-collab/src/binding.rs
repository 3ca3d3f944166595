//! Editor binding: host editor ⇄ document.
//!
//! ```text
//! host keystroke ──► EditEvent ──► local_edit ──► TextDocument (ops out)
//!
//! remote ops ──► AppliedEffect[] ──► apply_effects
//!                                       ├── coalesced TextPatch → surface
//!                                       └── caret/selection transform
//!
//! AwarenessEvent ──► apply_awareness ──► upsert / remove decoration
//! ```
//!
//! All offsets are visible characters (Unicode scalar values).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tandem_core::{AppliedEffect, ClientId, CoreError, Operation, TextDocument};

use crate::awareness::{AwarenessEvent, CursorColor};
use crate::protocol::{AwarenessState, Selection};

/// A text replacement in visible-character offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextPatch {
    pub offset: usize,
    pub deleted_length: usize,
    pub inserted_text: String,
}

impl TextPatch {
    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self {
            offset,
            deleted_length: 0,
            inserted_text: text.into(),
        }
    }

    pub fn delete(offset: usize, length: usize) -> Self {
        Self {
            offset,
            deleted_length: length,
            inserted_text: String::new(),
        }
    }

    pub fn replace(offset: usize, length: usize, text: impl Into<String>) -> Self {
        Self {
            offset,
            deleted_length: length,
            inserted_text: text.into(),
        }
    }
}

/// A local edit reported by the host editor (already applied to its buffer).
pub type EditEvent = TextPatch;

/// Remote cursor marker plus selection highlight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoration {
    pub client_id: ClientId,
    pub display_name: String,
    pub color: CursorColor,
    pub cursor: usize,
    pub selection: Option<Selection>,
}

impl From<&AwarenessState> for Decoration {
    fn from(state: &AwarenessState) -> Self {
        Self {
            client_id: state.client_id,
            display_name: state.display_name.clone(),
            color: state.color,
            cursor: state.cursor,
            selection: state.selection,
        }
    }
}

/// What the binding needs from a host editor.
pub trait EditorSurface: Send {
    fn text(&self) -> String;
    fn selection(&self) -> Selection;
    fn set_selection(&mut self, selection: Selection);
    /// Replace text without reporting it back as a local edit.
    fn apply_patch(&mut self, patch: &TextPatch);
    fn upsert_decoration(&mut self, decoration: &Decoration);
    fn remove_decoration(&mut self, client_id: &ClientId);
    /// Scroll so `offset` is in the middle of the viewport.
    fn center_on(&mut self, offset: usize);
}

/// Shift caret `k` for a remote change of `length` characters at `j`.
///
/// Edits at or before the caret move it; edits after it do not. A delete
/// spanning the caret collapses it onto the deletion point.
pub fn transform_offset(k: usize, j: usize, length: isize) -> usize {
    if j > k {
        return k;
    }
    if length >= 0 {
        k + length as usize
    } else {
        k.saturating_sub(length.unsigned_abs()).max(j)
    }
}

/// [`transform_offset`] applied to both ends of a selection.
pub fn transform_selection(selection: Selection, j: usize, length: isize) -> Selection {
    Selection::new(
        transform_offset(selection.anchor, j, length),
        transform_offset(selection.head, j, length),
    )
}

/// Fold per-character effects into contiguous patches, preserving order.
pub fn coalesce(effects: &[AppliedEffect]) -> Vec<TextPatch> {
    let mut patches: Vec<TextPatch> = Vec::new();
    let mut run = 0usize;

    for effect in effects {
        let AppliedEffect::Applied { visible_offset, length, value } = *effect else {
            continue;
        };
        if length > 0 {
            let Some(ch) = value else { continue };
            match patches.last_mut() {
                Some(last)
                    if last.deleted_length == 0 && last.offset + run == visible_offset =>
                {
                    last.inserted_text.push(ch);
                    run += 1;
                }
                _ => {
                    patches.push(TextPatch::insert(visible_offset, ch.to_string()));
                    run = 1;
                }
            }
        } else if length < 0 {
            match patches.last_mut() {
                Some(last) if last.inserted_text.is_empty() && last.offset == visible_offset => {
                    last.deleted_length += length.unsigned_abs();
                }
                _ => {
                    patches.push(TextPatch::delete(visible_offset, length.unsigned_abs()));
                    run = 0;
                }
            }
        }
    }
    patches
}

/// Live link between one editor surface and one document.
pub struct EditorBinding {
    surface: Box<dyn EditorSurface>,
    decorated: HashSet<ClientId>,
}

impl EditorBinding {
    /// Bind `surface`, replacing its content with the document's and
    /// drawing every known peer.
    pub fn attach(
        surface: Box<dyn EditorSurface>,
        doc: &TextDocument,
        peers: &[AwarenessState],
    ) -> Self {
        let mut binding = Self {
            surface,
            decorated: HashSet::new(),
        };
        binding.rehydrate(doc);
        for peer in peers {
            binding.apply_awareness(&AwarenessEvent::Updated(peer.clone()));
        }
        binding
    }

    /// Replace the whole surface text with the document's, clamping the caret.
    pub fn rehydrate(&mut self, doc: &TextDocument) {
        let current = self.surface.text();
        let text = doc.visible_text();
        if current != text {
            let old_len = current.chars().count();
            log::debug!("Hydrating editor: {old_len} -> {} chars", doc.len());
            self.surface.apply_patch(&TextPatch::replace(0, old_len, text));
        }
        let selection = self.surface.selection();
        let len = doc.len();
        self.surface
            .set_selection(Selection::new(selection.anchor.min(len), selection.head.min(len)));
    }

    /// Turn a host edit into operations: delete the replaced range, then insert.
    pub fn local_edit(
        &mut self,
        doc: &mut TextDocument,
        edit: &EditEvent,
    ) -> Result<Vec<Operation>, CoreError> {
        Self::edit_document(doc, edit)
    }

    /// Same as [`EditorBinding::local_edit`] for sessions without a bound editor.
    pub fn edit_document(doc: &mut TextDocument, edit: &EditEvent) -> Result<Vec<Operation>, CoreError> {
        let mut ops = Vec::new();
        if edit.deleted_length > 0 {
            ops.extend(doc.local_delete(edit.offset, edit.deleted_length)?);
        }
        if !edit.inserted_text.is_empty() {
            ops.extend(doc.local_insert(edit.offset, &edit.inserted_text)?);
        }
        Ok(ops)
    }

    /// Patch the surface for remote effects and shift the local selection.
    ///
    /// Shifts are applied per effect in arrival order, so several effects in
    /// one batch compose.
    pub fn apply_effects(&mut self, effects: &[AppliedEffect]) {
        let patches = coalesce(effects);
        if patches.is_empty() {
            return;
        }

        let before = self.surface.selection();
        let mut selection = before;
        for effect in effects {
            if let AppliedEffect::Applied { visible_offset, length, .. } = *effect {
                selection = transform_selection(selection, visible_offset, length);
            }
        }

        for patch in &patches {
            self.surface.apply_patch(patch);
        }
        if selection != before {
            self.surface.set_selection(selection);
        }
    }

    pub fn apply_awareness(&mut self, event: &AwarenessEvent) {
        match event {
            AwarenessEvent::Updated(state) => {
                self.surface.upsert_decoration(&Decoration::from(state));
                self.decorated.insert(state.client_id);
            }
            AwarenessEvent::Removed { client_id, .. } => {
                if self.decorated.remove(client_id) {
                    self.surface.remove_decoration(client_id);
                }
            }
        }
    }

    pub fn center_on(&mut self, offset: usize) {
        self.surface.center_on(offset);
    }

    pub fn selection(&self) -> Selection {
        self.surface.selection()
    }

    /// Remove every decoration and hand the surface back.
    pub fn detach(mut self) -> Box<dyn EditorSurface> {
        for client_id in self.decorated.drain() {
            self.surface.remove_decoration(&client_id);
        }
        self.surface
    }
}

// ───────────────────────────────────────────────────────────────────
// In-memory surface
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SurfaceState {
    text: String,
    selection: Option<Selection>,
    decorations: HashMap<ClientId, Decoration>,
    centered_on: Option<usize>,
    patches_applied: usize,
}

/// Headless editor surface. Clones share the same buffer, so a host (or a
/// test) can keep a handle after boxing one into a binding.
#[derive(Debug, Clone, Default)]
pub struct MemorySurface {
    inner: Arc<Mutex<SurfaceState>>,
}

impl MemorySurface {
    pub fn new(text: impl Into<String>) -> Self {
        let surface = Self::default();
        surface.state().text = text.into();
        surface
    }

    fn state(&self) -> MutexGuard<'_, SurfaceState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn contents(&self) -> String {
        self.state().text.clone()
    }

    pub fn caret(&self) -> Selection {
        self.state().selection.unwrap_or(Selection::caret(0))
    }

    pub fn decorations(&self) -> Vec<Decoration> {
        self.state().decorations.values().cloned().collect()
    }

    pub fn decoration(&self, client_id: &ClientId) -> Option<Decoration> {
        self.state().decorations.get(client_id).cloned()
    }

    pub fn centered_on(&self) -> Option<usize> {
        self.state().centered_on
    }

    pub fn patches_applied(&self) -> usize {
        self.state().patches_applied
    }

    /// Simulate the user typing: edit the buffer, move the caret past the
    /// inserted text and return the event to report to the binding.
    pub fn type_edit(&self, edit: TextPatch) -> EditEvent {
        let mut state = self.state();
        splice(&mut state.text, &edit);
        let caret = edit.offset + edit.inserted_text.chars().count();
        state.selection = Some(Selection::caret(caret));
        edit
    }

    pub fn place_caret(&self, selection: Selection) {
        self.state().selection = Some(selection);
    }
}

fn byte_index(text: &str, offset: usize) -> usize {
    text.char_indices()
        .nth(offset)
        .map(|(index, _)| index)
        .unwrap_or(text.len())
}

fn splice(text: &mut String, patch: &TextPatch) {
    let start = byte_index(text, patch.offset);
    let end = byte_index(text, patch.offset + patch.deleted_length);
    text.replace_range(start..end, &patch.inserted_text);
}

impl EditorSurface for MemorySurface {
    fn text(&self) -> String {
        self.contents()
    }

    fn selection(&self) -> Selection {
        self.caret()
    }

    fn set_selection(&mut self, selection: Selection) {
        self.state().selection = Some(selection);
    }

    fn apply_patch(&mut self, patch: &TextPatch) {
        let mut state = self.state();
        splice(&mut state.text, patch);
        state.patches_applied += 1;
    }

    fn upsert_decoration(&mut self, decoration: &Decoration) {
        self.state()
            .decorations
            .insert(decoration.client_id, decoration.clone());
    }

    fn remove_decoration(&mut self, client_id: &ClientId) {
        self.state().decorations.remove(client_id);
    }

    fn center_on(&mut self, offset: usize) {
        self.state().centered_on = Some(offset);
    }
}
