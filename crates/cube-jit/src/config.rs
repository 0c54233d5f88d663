//! Analyzer and compiler tuning knobs.
//!
//! Everything here is an explicitly constructed value passed by reference;
//! there is no ambient global configuration. `from_env` exists for the same
//! reason the rest of the emulator reads `CUBE_*` variables: quick A/B runs
//! without a rebuild.

/// Options controlling block analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalyzerOptions {
    /// Follow unconditional direct branches instead of ending the block.
    pub branch_follow: bool,
    /// Maximum number of branch follows per block. The best value varies by
    /// workload; small values lose merge opportunities, large ones bloat
    /// generated code and increase invalidation cost.
    pub branch_follow_limit: u32,
    /// Let conditional branches and trap instructions continue the block,
    /// deferring the control-flow decision to the emitted code.
    pub conditional_continue: bool,
    /// Bubble compare instructions toward their consuming branch.
    pub reorder_cmp: bool,
    /// Bubble carry-producing and carry-consuming instructions toward each
    /// other, in both directions.
    pub reorder_carry: bool,
}

impl Default for AnalyzerOptions {
    fn default() -> Self {
        Self {
            branch_follow: true,
            branch_follow_limit: 2,
            conditional_continue: true,
            reorder_cmp: true,
            reorder_carry: true,
        }
    }
}

impl AnalyzerOptions {
    /// Defaults overridden by `CUBE_JIT_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            branch_follow: parse_env_bool("CUBE_JIT_BRANCH_FOLLOW", defaults.branch_follow),
            branch_follow_limit: parse_env_u32(
                "CUBE_JIT_BRANCH_FOLLOW_LIMIT",
                defaults.branch_follow_limit,
            ),
            conditional_continue: parse_env_bool(
                "CUBE_JIT_COND_CONTINUE",
                defaults.conditional_continue,
            ),
            reorder_cmp: parse_env_bool("CUBE_JIT_REORDER_CMP", defaults.reorder_cmp),
            reorder_carry: parse_env_bool("CUBE_JIT_REORDER_CARRY", defaults.reorder_carry),
        }
    }

    /// Options with every optimization pass disabled; analysis still decodes
    /// and classifies, but blocks end at the first end-block instruction and
    /// nothing is reordered.
    pub fn conservative() -> Self {
        Self {
            branch_follow: false,
            branch_follow_limit: 0,
            conditional_continue: false,
            reorder_cmp: false,
            reorder_carry: false,
        }
    }
}

/// Options for a whole compile pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitOptions {
    /// Maximum number of guest instructions per compiled block.
    pub max_block_instructions: usize,
    pub analyzer: AnalyzerOptions,
}

impl Default for JitOptions {
    fn default() -> Self {
        Self {
            max_block_instructions: 256,
            analyzer: AnalyzerOptions::default(),
        }
    }
}

impl JitOptions {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_block_instructions: parse_env_u32(
                "CUBE_JIT_MAX_BLOCK_INSNS",
                defaults.max_block_instructions as u32,
            )
            .max(1) as usize,
            analyzer: AnalyzerOptions::from_env(),
        }
    }
}

fn parse_env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_env_bool(name: &str, default: bool) -> bool {
    let Ok(raw) = std::env::var(name) else {
        return default;
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "off" | "false" | "no" => false,
        "1" | "on" | "true" | "yes" => true,
        other => {
            log::warn!("unknown value {other:?} for {name}; using default");
            default
        }
    }
}
