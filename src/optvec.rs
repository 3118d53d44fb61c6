//! Optimization vectors: the per-method JIT behavior summary the rest of the
//! engine scores, fingerprints, and diffs. See `SPEC_FULL.md` §4.2.

use serde::{Deserialize, Serialize};

use crate::error::ParserError;

/// Feature enumeration, fixed at build time. Adding a feature only ever
/// means appending a name here — parser and scorer both index off this
/// slice, never off a hardcoded count.
pub const FEATURES: &[&str] = &[
    "Inlining",
    "LoopUnrolling",
    "CCP",
    "EscapeAnalysis",
    "Vectorization",
    "DeadCodeElimination",
    "NullCheckElimination",
    "RangeCheckElimination",
    "Intrinsification",
    "OSREntry",
];

pub const NUM_FEATURES: usize = FEATURES.len();

pub fn feature_index(name: &str) -> Option<usize> {
    FEATURES.iter().position(|f| *f == name)
}

/// A fixed-length vector of non-negative integer counts, one per tracked
/// optimization feature. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizationVector(pub Vec<u64>);

impl Default for OptimizationVector {
    fn default() -> Self {
        Self::zero()
    }
}

impl OptimizationVector {
    pub fn zero() -> Self {
        Self(vec![0; NUM_FEATURES])
    }

    pub fn get(&self, feature: &str) -> u64 {
        feature_index(feature).map(|i| self.0[i]).unwrap_or(0)
    }

    pub fn set(&mut self, index: usize, value: u64) {
        self.0[index] = value;
    }

    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }

    pub fn active_feature_count(&self) -> usize {
        self.0.iter().filter(|&&c| c > 0).count()
    }

    pub fn max_single_feature(&self) -> u64 {
        self.0.iter().copied().max().unwrap_or(0)
    }

    /// Element-wise sum, used to build the merged vector across methods.
    pub fn merge(&self, other: &OptimizationVector) -> OptimizationVector {
        OptimizationVector(self.0.iter().zip(other.0.iter()).map(|(a, b)| a + b).collect())
    }

    /// Bucket each count into an exponentially-growing bucket:
    /// `0->0, 1->1, 2->2, n->next power of two >= n`. Two programs land in
    /// the same corpus slot iff their bucketed vectors are element-wise
    /// equal.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint(self.0.iter().map(|&n| bucket(n)).collect())
    }
}

fn bucket(n: u64) -> u64 {
    if n <= 2 {
        n
    } else {
        n.next_power_of_two()
    }
}

/// The hashed optimization vector used as a corpus slot key. Bucketing is
/// idempotent: `bucket(bucket(v)) == bucket(v)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub Vec<u64>);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompileKind {
    Standard,
    Osr,
}

/// One `OPTS_START ... OPTS_END` block: a single method compilation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodOptimizationVector {
    pub class_name: String,
    pub method_name: String,
    pub signature: String,
    pub kind: CompileKind,
    pub bci: i64,
    pub compile_id: u64,
    pub vector: OptimizationVector,
}

/// The ordered sequence of per-method vectors produced by one JIT run, plus
/// their element-wise sum. Sequence order reflects compile order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptimizationVectors {
    pub methods: Vec<MethodOptimizationVector>,
    pub merged: OptimizationVector,
}

impl OptimizationVectors {
    /// The per-method vector with the largest total count: the
    /// representative used for scoring and fingerprinting. `None` if no
    /// method was compiled.
    pub fn hot_method(&self) -> Option<&MethodOptimizationVector> {
        self.methods.iter().max_by_key(|m| m.vector.total())
    }
}

/// Scan JIT stdout for `OPTS_START ... OPTS_END` blocks and build an
/// `OptimizationVectors`. Unknown features are dropped with a logged
/// warning; malformed `key=value` lines are skipped; everything before the
/// first `OPTS_START` and outside any block is ignored.
pub fn parse_jit_stdout(stdout: &str) -> OptimizationVectors {
    let mut methods = Vec::new();
    let mut merged = OptimizationVector::zero();

    let Some(first) = stdout.find("OPTS_START") else {
        return OptimizationVectors { methods, merged };
    };

    // Split the remainder on further OPTS_START markers.
    for segment in stdout[first..].split("OPTS_START") {
        if segment.trim().is_empty() {
            continue;
        }
        let Some(end_idx) = segment.find("OPTS_END") else {
            continue;
        };
        let block = &segment[..end_idx];
        match parse_block(block) {
            Ok(mv) => {
                merged = merged.merge(&mv.vector);
                methods.push(mv);
            }
            Err(e) => {
                log::warn!(target: "optvec", "dropping malformed OPTS block: {e}");
            }
        }
    }

    OptimizationVectors { methods, merged }
}

fn parse_block(block: &str) -> Result<MethodOptimizationVector, ParserError> {
    let mut lines = block.lines().map(str::trim).filter(|l| !l.is_empty());
    let header = lines
        .next()
        .ok_or_else(|| ParserError::MalformedBlock("empty block".into()))?;

    let fields: Vec<&str> = header.split('|').collect();
    if fields.len() != 7 || fields[0] != "Opts" {
        return Err(ParserError::MalformedBlock(format!("bad header {header:?}")));
    }
    let class_name = fields[1].to_string();
    let method_name = fields[2].to_string();
    let signature = fields[3].to_string();
    let kind = if fields[4].eq_ignore_ascii_case("OSR") {
        CompileKind::Osr
    } else {
        CompileKind::Standard
    };
    let bci: i64 = fields[5]
        .parse()
        .map_err(|_| ParserError::MalformedBlock(format!("bad bci {:?}", fields[5])))?;
    let compile_id: u64 = fields[6]
        .parse()
        .map_err(|_| ParserError::MalformedBlock(format!("bad compile id {:?}", fields[6])))?;

    let mut vector = OptimizationVector::zero();
    for line in lines {
        let Some((key, value)) = line.split_once('=') else {
            log::warn!(target: "optvec", "skipping malformed feature line {line:?}");
            continue;
        };
        let Some(idx) = feature_index(key.trim()) else {
            log::warn!(target: "optvec", "dropping unknown feature {key:?}");
            continue;
        };
        match value.trim().parse::<u64>() {
            Ok(count) => vector.set(idx, count),
            Err(_) => {
                log::warn!(target: "optvec", "skipping malformed feature value {value:?}");
            }
        }
    }

    Ok(MethodOptimizationVector {
        class_name,
        method_name,
        signature,
        kind,
        bci,
        compile_id,
        vector,
    })
}
