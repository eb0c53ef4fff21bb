//! Content-conversion contract.
//!
//! The real conversion pipeline (attribute stacks, filter drivers, encoding
//! tables) lives outside this crate. The populator needs exactly two entry
//! points from it: a classification deciding whether an entry may be
//! populated out of order, and the smudge step that turns blob bytes into
//! their working-tree form.

use std::io;
use std::path::Path;

use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;

/// How an entry's conversion can be driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertClass {
    /// Fully in-core conversion; eligible for parallel population.
    Incore,
    /// Needs a single-shot filter subprocess; sequential only.
    IncoreFilter,
    /// Needs a long-running filter process; sequential only.
    IncoreProcess,
    /// Could be streamed. Preload still reads the whole blob, but the entry
    /// is eligible for parallel population.
    Streamable,
}

impl ConvertClass {
    /// Whether entries of this class may be handed to helpers.
    pub fn parallel_eligible(self) -> bool {
        matches!(self, ConvertClass::Incore | ConvertClass::Streamable)
    }
}

/// Filter-driver requirement recorded by the attribute stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum AttrAction {
    /// No filter driver configured.
    None = 0,
    /// `filter=<driver>` with a clean/smudge command pair.
    Filter = 1,
    /// `filter=<driver>` backed by a long-running process.
    Process = 2,
}

impl Default for AttrAction {
    fn default() -> Self {
        AttrAction::None
    }
}

/// Line-ending conversion recorded by the attribute stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum CrlfAction {
    /// Leave bytes alone.
    None = 0,
    /// Convert to CRLF on checkout.
    Text = 1,
    /// LF in the worktree; nothing to do on checkout.
    Input = 2,
}

impl Default for CrlfAction {
    fn default() -> Self {
        CrlfAction::None
    }
}

/// Conversion attributes evaluated per entry, in index order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvertAttrs {
    /// Filter-driver requirement.
    pub attr_action: AttrAction,
    /// Line-ending conversion.
    pub crlf_action: CrlfAction,
    /// `$Id$` keyword expansion requested.
    pub ident: bool,
    /// `working-tree-encoding` attribute, when set.
    pub working_tree_encoding: Option<String>,
}

/// The conversion pipeline as seen by the populator.
pub trait Converter: Send + Sync {
    /// Decide how an entry with these attributes can be converted.
    fn classify(&self, attrs: &ConvertAttrs) -> ConvertClass;

    /// Convert blob bytes to their working-tree form.
    ///
    /// `None` means the source is already in working-tree form and may be
    /// written as-is.
    fn smudge(
        &self,
        attrs: &ConvertAttrs,
        path: &Path,
        src: &[u8],
    ) -> io::Result<Option<Vec<u8>>>;
}

/// Built-in pipeline: classifies from the recorded attributes and performs
/// only the in-core CRLF rewrite. Filter drivers and encodings are the
/// external pipeline's business.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConverter;

impl Converter for DefaultConverter {
    fn classify(&self, attrs: &ConvertAttrs) -> ConvertClass {
        match attrs.attr_action {
            AttrAction::Filter => ConvertClass::IncoreFilter,
            AttrAction::Process => ConvertClass::IncoreProcess,
            AttrAction::None if attrs.working_tree_encoding.is_some() => ConvertClass::Streamable,
            AttrAction::None => ConvertClass::Incore,
        }
    }

    fn smudge(
        &self,
        attrs: &ConvertAttrs,
        _path: &Path,
        src: &[u8],
    ) -> io::Result<Option<Vec<u8>>> {
        if attrs.crlf_action != CrlfAction::Text {
            return Ok(None);
        }
        // A blob that already carries CR bytes is left untouched, matching
        // the round-trip safety rule of the external pipeline.
        if src.contains(&b'\r') {
            return Ok(None);
        }
        let lf_count = src.iter().filter(|&&b| b == b'\n').count();
        if lf_count == 0 {
            return Ok(None);
        }
        let mut out = Vec::with_capacity(src.len() + lf_count);
        for &b in src {
            if b == b'\n' {
                out.push(b'\r');
            }
            out.push(b);
        }
        Ok(Some(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(attr_action: AttrAction, crlf_action: CrlfAction) -> ConvertAttrs {
        ConvertAttrs {
            attr_action,
            crlf_action,
            ..ConvertAttrs::default()
        }
    }

    #[test]
    fn filter_classes_are_never_parallel_eligible() {
        let c = DefaultConverter;
        assert_eq!(
            c.classify(&attrs(AttrAction::Filter, CrlfAction::None)),
            ConvertClass::IncoreFilter
        );
        assert_eq!(
            c.classify(&attrs(AttrAction::Process, CrlfAction::None)),
            ConvertClass::IncoreProcess
        );
        assert!(!ConvertClass::IncoreFilter.parallel_eligible());
        assert!(!ConvertClass::IncoreProcess.parallel_eligible());
        assert!(ConvertClass::Incore.parallel_eligible());
        assert!(ConvertClass::Streamable.parallel_eligible());
    }

    #[test]
    fn text_smudge_rewrites_lf() {
        let c = DefaultConverter;
        let out = c
            .smudge(&attrs(AttrAction::None, CrlfAction::Text), Path::new("a"), b"a\nb\n")
            .unwrap();
        assert_eq!(out.as_deref(), Some(&b"a\r\nb\r\n"[..]));
    }

    #[test]
    fn smudge_leaves_crlf_and_binary_alone() {
        let c = DefaultConverter;
        let a = attrs(AttrAction::None, CrlfAction::Text);
        assert_eq!(c.smudge(&a, Path::new("a"), b"a\r\nb\r\n").unwrap(), None);
        assert_eq!(c.smudge(&a, Path::new("a"), b"no newline").unwrap(), None);
        let plain = attrs(AttrAction::None, CrlfAction::None);
        assert_eq!(c.smudge(&plain, Path::new("a"), b"a\nb\n").unwrap(), None);
    }

    #[test]
    fn wire_codes_round_trip() {
        assert_eq!(AttrAction::try_from(2u8), Ok(AttrAction::Process));
        assert_eq!(u8::from(CrlfAction::Input), 2);
        assert!(AttrAction::try_from(9u8).is_err());
    }
}
