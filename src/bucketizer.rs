//! Deterministic crash deduplication (`SPEC_FULL.md` §4.6): turns noisy VM
//! diagnostic text and source into a short, stable bucket id so the same
//! underlying defect doesn't spawn a new directory every time it's hit.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

const MAX_FRAMES: usize = 5;
pub const UNKNOWN_BUCKET: &str = "b_unknown";

static HEX_ADDR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"0x[0-9a-fA-F]+").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static GENERATED_CLASS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"c2fuzz\d+").unwrap());
static SIGNAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bSIG[A-Z]+\b").unwrap());

#[derive(Debug, Clone)]
pub struct BugSignature {
    pub bucket_id: String,
    pub reason: String,
    pub signal: String,
    pub problematic_frame: String,
    pub compile_task: String,
    pub top_frames: Vec<String>,
    pub int_exit: Option<i32>,
    pub jit_exit: Option<i32>,
    pub source_hash: String,
    pub mutator: String,
    pub seed_ancestor: String,
    pub canonical: String,
}

pub struct BugSignatureInput<'a> {
    pub reason: &'a str,
    pub diagnostic_text: &'a str,
    pub int_exit: Option<i32>,
    pub jit_exit: Option<i32>,
    pub source: &'a str,
    pub mutator: &'a str,
    pub seed_ancestor: &'a str,
}

fn normalize_line(line: &str) -> String {
    let stripped = HEX_ADDR.replace_all(line, "0x");
    WHITESPACE.replace_all(stripped.trim(), " ").into_owned()
}

fn extract_signal(text: &str) -> String {
    SIGNAL.find(text).map(|m| m.as_str().to_string()).unwrap_or_else(|| "none".to_string())
}

fn extract_problematic_frame(text: &str) -> String {
    for (i, line) in text.lines().enumerate() {
        if line.contains("Problematic frame:") {
            if let Some(next) = text.lines().nth(i + 1) {
                return normalize_line(next);
            }
        }
    }
    String::new()
}

fn extract_compile_task(text: &str) -> String {
    text.lines()
        .find(|l| l.contains("Current CompileTask"))
        .map(normalize_line)
        .unwrap_or_default()
}

fn extract_top_frames(text: &str, limit: usize) -> Vec<String> {
    let mut in_native = false;
    let mut frames = Vec::new();
    for line in text.lines() {
        if line.contains("Native frames:") {
            in_native = true;
            continue;
        }
        if !in_native {
            continue;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            break;
        }
        frames.push(normalize_line(trimmed));
        if frames.len() >= limit {
            break;
        }
    }
    frames
}

fn normalize_source(source: &str) -> String {
    let renamed = GENERATED_CLASS.replace_all(source, "CLASS");
    WHITESPACE.replace_all(renamed.trim(), " ").into_owned()
}

fn sha256_hex(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn exit_field(exit: Option<i32>) -> String {
    exit.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string())
}

/// Build the canonical `key=value` signature string and its derived bucket
/// id. Infallible in this implementation (hashing never fails); callers
/// that can't even assemble an input should fall back to
/// [`UNKNOWN_BUCKET`] themselves per `SPEC_FULL.md` §7.
pub fn bucketize(input: &BugSignatureInput) -> BugSignature {
    let signal = extract_signal(input.diagnostic_text);
    let problematic_frame = extract_problematic_frame(input.diagnostic_text);
    let compile_task = extract_compile_task(input.diagnostic_text);
    let top_frames = extract_top_frames(input.diagnostic_text, MAX_FRAMES);
    let normalized_source = normalize_source(input.source);
    let source_hash = sha256_hex(&normalized_source);

    let mut canonical = String::new();
    canonical.push_str(&format!("reason={}\n", input.reason));
    canonical.push_str(&format!("signal={signal}\n"));
    canonical.push_str(&format!("problematic_frame={problematic_frame}\n"));
    canonical.push_str(&format!("compile_task={compile_task}\n"));
    for i in 0..MAX_FRAMES {
        let frame = top_frames.get(i).map(String::as_str).unwrap_or("");
        canonical.push_str(&format!("frame_{i}={frame}\n"));
    }
    canonical.push_str(&format!("int_exit={}\n", exit_field(input.int_exit)));
    canonical.push_str(&format!("jit_exit={}\n", exit_field(input.jit_exit)));
    canonical.push_str(&format!("source_hash={source_hash}\n"));
    canonical.push_str(&format!("mutator={}\n", input.mutator));
    canonical.push_str(&format!("seed_ancestor={}\n", input.seed_ancestor));

    let digest_hex = sha256_hex(&canonical);
    let bucket_id = format!("b_{}", &digest_hex[..12]);

    BugSignature {
        bucket_id,
        reason: input.reason.to_string(),
        signal,
        problematic_frame,
        compile_task,
        top_frames,
        int_exit: input.int_exit,
        jit_exit: input.jit_exit,
        source_hash,
        mutator: input.mutator.to_string(),
        seed_ancestor: input.seed_ancestor.to_string(),
        canonical,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_input() -> BugSignatureInput<'static> {
        BugSignatureInput {
            reason: "different exit codes",
            diagnostic_text: "Problematic frame:\nC  [libjvm.so+0x1a2b3c]  Foo::bar+0x10\nCurrent CompileTask:\nC2:123  4  b  Foo::bar (10 bytes)\nNative frames:\nC  [libjvm.so+0x1]\nC  [libc.so+0x2]\n",
            int_exit: Some(0),
            jit_exit: Some(134),
            source: "class c2fuzz42 { void m() {} }",
            mutator: "swap-operands",
            seed_ancestor: "seed1",
        }
    }

    #[test]
    fn bucketize_is_deterministic() {
        let a = bucketize(&sample_input());
        let b = bucketize(&sample_input());
        assert_eq!(a.bucket_id, b.bucket_id);
        assert_eq!(a.canonical, b.canonical);
    }

    #[test]
    fn bucket_id_has_expected_shape() {
        let sig = bucketize(&sample_input());
        assert!(sig.bucket_id.starts_with("b_"));
        assert_eq!(sig.bucket_id.len(), 14);
    }

    #[test]
    fn problematic_frame_strips_addresses() {
        let sig = bucketize(&sample_input());
        assert_eq!(sig.problematic_frame, "C [libjvm.so+0x] Foo::bar+0x");
    }

    #[test]
    fn source_normalization_replaces_generated_identifiers() {
        let sig = bucketize(&sample_input());
        let other = bucketize(&BugSignatureInput {
            source: "class c2fuzz999 { void m() {} }",
            ..sample_input()
        });
        assert_eq!(sig.source_hash, other.source_hash);
    }

    #[test]
    fn different_reason_changes_bucket_id() {
        let a = bucketize(&sample_input());
        let b = bucketize(&BugSignatureInput { reason: "divergent output", ..sample_input() });
        assert_ne!(a.bucket_id, b.bucket_id);
    }
}
