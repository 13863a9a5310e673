//! Player-script analyzer: the `preprocess` and `extract` pair.
//!
//! `preprocess` takes the raw multi-megabyte script, locates the signature
//! transform, its helper object and the n-transform routine, and emits a
//! compact versioned JSON document of just those regions. That is the
//! CPU-bound pass (several full-script scans) and runs on the worker pool.
//!
//! `extract` compiles the document's regions into op-programs (reverse /
//! splice / swap steps) that apply the per-character permutation to a token
//! string. A region that does not compile into the known op vocabulary
//! yields an absent solver, which means "this player has no such transform".
//!
//! Both functions are pure and deterministic; results are cached by player
//! fingerprint upstream of this module.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const PREPROCESSED_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum AnalyzerError {
    /// Payload is not a player script at all; retrying cannot help.
    Malformed(String),
    /// Preprocessed document is unreadable or from an unknown version.
    InvalidDocument(String),
}

impl std::fmt::Display for AnalyzerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnalyzerError::Malformed(msg) => write!(f, "malformed player script: {msg}"),
            AnalyzerError::InvalidDocument(msg) => {
                write!(f, "invalid preprocessed document: {msg}")
            }
        }
    }
}

impl std::error::Error for AnalyzerError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverEvalError {
    EmptyInput,
    EmptyResult,
}

impl std::fmt::Display for SolverEvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SolverEvalError::EmptyInput => write!(f, "solver input is empty"),
            SolverEvalError::EmptyResult => write!(f, "solver produced an empty string"),
        }
    }
}

impl std::error::Error for SolverEvalError {}

// ---------------------------------------------------------------------------
// Preprocessed document
// ---------------------------------------------------------------------------

/// One extracted routine: the function's parameter name, its body, and the
/// helper object it dispatches through (when it uses one).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    pub param: String,
    pub body: String,
    pub helper_name: Option<String>,
    pub helper_body: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessedDoc {
    pub version: u32,
    pub sig: Option<Region>,
    pub n: Option<Region>,
}

// ---------------------------------------------------------------------------
// Solvers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransformOp {
    Reverse,
    /// Drop the first N characters.
    Splice(usize),
    /// Swap position 0 with position N modulo length.
    Swap(usize),
}

/// A compiled token transform. Applying it walks the op list over the
/// token's characters, mirroring the script's own array pipeline.
#[derive(Debug, Clone)]
pub struct Solver {
    ops: Vec<TransformOp>,
}

impl Solver {
    /// The empty program: output equals input. Used by fixtures that need a
    /// known-good pair.
    pub fn identity() -> Self {
        Solver { ops: Vec::new() }
    }

    pub fn apply(&self, input: &str) -> std::result::Result<String, SolverEvalError> {
        if input.is_empty() {
            return Err(SolverEvalError::EmptyInput);
        }
        let mut chars: Vec<char> = input.chars().collect();
        for op in &self.ops {
            match *op {
                TransformOp::Reverse => chars.reverse(),
                TransformOp::Splice(n) => {
                    let n = n.min(chars.len());
                    chars.drain(0..n);
                }
                TransformOp::Swap(n) => {
                    if !chars.is_empty() {
                        let idx = n % chars.len();
                        chars.swap(0, idx);
                    }
                }
            }
        }
        if chars.is_empty() {
            return Err(SolverEvalError::EmptyResult);
        }
        Ok(chars.into_iter().collect())
    }
}

/// The two callables extracted from one player version. An absent slot
/// means the player has no transform of that kind.
#[derive(Debug, Clone)]
pub struct SolverPair {
    pub sig: Option<Solver>,
    pub n: Option<Solver>,
}

impl SolverPair {
    pub fn is_empty(&self) -> bool {
        self.sig.is_none() && self.n.is_none()
    }
}

// ---------------------------------------------------------------------------
// preprocess
// ---------------------------------------------------------------------------

static FN_DEF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?:function\s+([A-Za-z0-9$_]+)|([A-Za-z0-9$_]+)\s*=\s*function)\s*\(\s*([A-Za-z0-9$_]+)\s*\)\s*\{"#,
    )
    .unwrap()
});

/// How modern players dispatch the n-transform: `..get("n"))&&(b=NAME(` or
/// `..get("n"))&&(b=NAME[0](` with an alias array.
static N_HOOK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\.get\("n"\)\)&&\([A-Za-z0-9$_]+=([A-Za-z0-9$_]+)(?:\[(\d+)\])?\("#).unwrap()
});

static HELPER_FN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([A-Za-z0-9$_]+)\s*:\s*function\s*\(([^)]*)\)\s*\{([^{}]*)\}"#).unwrap()
});

/// Normalize a raw player script into the compact region document.
pub fn preprocess(raw: &str) -> std::result::Result<String, AnalyzerError> {
    if raw.len() < 100 {
        return Err(AnalyzerError::Malformed(format!(
            "script is {} bytes, too short to be a player",
            raw.len()
        )));
    }
    if !raw.contains("function") {
        return Err(AnalyzerError::Malformed(
            "script contains no function definitions".into(),
        ));
    }

    let candidates = find_splitjoin_functions(raw);

    // The signature routine is the split/join function that dispatches
    // through a helper object; the first such candidate wins.
    let sig = candidates
        .iter()
        .find(|c| helper_call_name(&c.body, &c.param).is_some())
        .or_else(|| candidates.first())
        .map(|c| build_region(raw, c));

    // The n routine: prefer the script's own dispatch site, fall back to a
    // second split/join candidate distinct from the signature one.
    let n = find_n_function(raw)
        .or_else(|| {
            let sig_body = sig.as_ref().map(|r| r.body.clone()).unwrap_or_default();
            candidates
                .iter()
                .find(|c| c.body != sig_body)
                .map(|c| (c.param.clone(), c.body.clone()))
        })
        .map(|(param, body)| {
            let candidate = FnCandidate { param, body };
            build_region(raw, &candidate)
        });

    let doc = PreprocessedDoc {
        version: PREPROCESSED_VERSION,
        sig,
        n,
    };
    serde_json::to_string(&doc)
        .map_err(|e| AnalyzerError::Malformed(format!("region serialization failed: {e}")))
}

struct FnCandidate {
    param: String,
    body: String,
}

/// Scan the whole script for `function (x) { x.split(""); ... return
/// x.join("") }` shapes, named or assigned.
fn find_splitjoin_functions(script: &str) -> Vec<FnCandidate> {
    let mut out = Vec::new();
    for caps in FN_DEF_RE.captures_iter(script) {
        let param = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
        let open = caps.get(0).unwrap().end() - 1;
        let Some((body_start, body_end)) = balanced_body(script, open) else {
            continue;
        };
        let body = &script[body_start..body_end];
        if body.contains(&format!("{param}.split(\"\")"))
            && body.contains(&format!("return {param}.join(\"\")"))
        {
            out.push(FnCandidate {
                param: param.to_string(),
                body: body.to_string(),
            });
        }
    }
    out
}

/// Resolve the n-transform function via the `get("n")` dispatch site.
fn find_n_function(script: &str) -> Option<(String, String)> {
    let caps = N_HOOK_RE.captures(script)?;
    let mut name = caps.get(1)?.as_str().to_string();

    // `b=Alias[0](...)`: resolve the alias array to the real function name.
    if let Some(idx) = caps.get(2) {
        let alias_re = Regex::new(&format!(
            r#"(?:var\s+)?{}\s*=\s*\[([A-Za-z0-9$_,\s]+)\]"#,
            regex::escape(&name)
        ))
        .ok()?;
        let list = alias_re.captures(script)?.get(1)?.as_str();
        let i: usize = idx.as_str().parse().ok()?;
        name = list.split(',').nth(i)?.trim().to_string();
    }

    find_function(script, &name)
}

/// Locate a function definition by name and return (param, body).
fn find_function(script: &str, name: &str) -> Option<(String, String)> {
    let re = Regex::new(&format!(
        r#"(?:function\s+{n}|{n}\s*=\s*function)\s*\(\s*([A-Za-z0-9$_]+)\s*\)\s*\{{"#,
        n = regex::escape(name)
    ))
    .ok()?;
    let caps = re.captures(script)?;
    let param = caps.get(1)?.as_str().to_string();
    let open = caps.get(0)?.end() - 1;
    let (body_start, body_end) = balanced_body(script, open)?;
    Some((param, script[body_start..body_end].to_string()))
}

/// Attach the helper object (when the body dispatches through one) to the
/// extracted routine.
fn build_region(script: &str, candidate: &FnCandidate) -> Region {
    let helper_name = helper_call_name(&candidate.body, &candidate.param);
    let helper_body = helper_name
        .as_deref()
        .and_then(|name| find_object_literal(script, name));
    Region {
        param: candidate.param.clone(),
        body: candidate.body.clone(),
        helper_name,
        helper_body,
    }
}

/// Name of the object a routine body dispatches through, e.g. `XY` in
/// `XY.abc(a,2)`. The routine's own parameter does not count.
fn helper_call_name(body: &str, param: &str) -> Option<String> {
    let re = Regex::new(&format!(
        r#"([A-Za-z0-9$_]+)\.[A-Za-z0-9$_]+\(\s*{p}\s*[,)]"#,
        p = regex::escape(param)
    ))
    .ok()?;
    let result = re
        .captures_iter(body)
        .map(|c| c.get(1).unwrap().as_str())
        .find(|name| name != &param)
        .map(str::to_string);
    result
}

/// Extract the body of `var NAME = { ... }` with balanced braces.
fn find_object_literal(script: &str, name: &str) -> Option<String> {
    let re = Regex::new(&format!(
        r#"(?:var|let|const)?\s*{}\s*=\s*\{{"#,
        regex::escape(name)
    ))
    .ok()?;
    let m = re.find(script)?;
    let open = m.end() - 1;
    let (start, end) = balanced_body(script, open)?;
    Some(script[start..end].to_string())
}

/// Walk from the opening brace at `open` to its matching close, skipping
/// string literals. Returns the body span exclusive of both braces.
fn balanced_body(s: &str, open: usize) -> Option<(usize, usize)> {
    let bytes = s.as_bytes();
    if bytes.get(open) != Some(&b'{') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string: Option<u8> = None;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == quote {
                in_string = None;
            }
            continue;
        }
        match b {
            b'"' | b'\'' | b'`' => in_string = Some(b),
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some((open + 1, i));
                }
            }
            _ => {}
        }
    }
    None
}

// ---------------------------------------------------------------------------
// extract
// ---------------------------------------------------------------------------

/// Compile a preprocessed document into the Solvers Pair.
pub fn extract(preprocessed: &str) -> std::result::Result<SolverPair, AnalyzerError> {
    let doc: PreprocessedDoc = serde_json::from_str(preprocessed)
        .map_err(|e| AnalyzerError::InvalidDocument(e.to_string()))?;
    if doc.version != PREPROCESSED_VERSION {
        return Err(AnalyzerError::InvalidDocument(format!(
            "unknown document version {}",
            doc.version
        )));
    }

    Ok(SolverPair {
        sig: doc.sig.as_ref().and_then(compile_region),
        n: doc.n.as_ref().and_then(compile_region),
    })
}

#[derive(Clone, Copy)]
enum HelperKind {
    Reverse,
    Splice,
    Swap,
}

/// Compile one routine into an op program. Returns `None` when the routine
/// uses vocabulary outside reverse/splice/swap, which downstream treats as
/// "no transform of this kind".
fn compile_region(region: &Region) -> Option<Solver> {
    let helpers = region
        .helper_body
        .as_deref()
        .map(classify_helpers)
        .unwrap_or_default();

    let p = regex::escape(&region.param);
    let call_re = Regex::new(&format!(
        r#"([A-Za-z0-9$_]+)\.([A-Za-z0-9$_]+)\(\s*{p}\s*(?:,\s*(\d+))?\s*\)|{p}\.reverse\(\)|{p}\.splice\(\s*0\s*,\s*(\d+)\s*\)"#,
    ))
    .ok()?;

    let mut ops = Vec::new();
    for caps in call_re.captures_iter(&region.body) {
        if let Some(method) = caps.get(2) {
            let obj = caps.get(1).unwrap().as_str();
            if obj == region.param {
                continue;
            }
            let arg: usize = caps
                .get(3)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0);
            match helpers.iter().find(|(name, _)| name.as_str() == method.as_str()) {
                Some((_, HelperKind::Reverse)) => ops.push(TransformOp::Reverse),
                Some((_, HelperKind::Splice)) => ops.push(TransformOp::Splice(arg)),
                Some((_, HelperKind::Swap)) => ops.push(TransformOp::Swap(arg)),
                None => return None,
            }
        } else if let Some(n) = caps.get(4) {
            ops.push(TransformOp::Splice(n.as_str().parse().ok()?));
        } else {
            ops.push(TransformOp::Reverse);
        }
    }

    if ops.is_empty() {
        None
    } else {
        Some(Solver { ops })
    }
}

/// Map helper-object member names to op kinds by inspecting their bodies,
/// the same classification the script's own call sites rely on.
fn classify_helpers(helper_body: &str) -> Vec<(String, HelperKind)> {
    let mut out = Vec::new();
    for caps in HELPER_FN_RE.captures_iter(helper_body) {
        let name = caps.get(1).unwrap().as_str().to_string();
        let body = caps.get(3).unwrap().as_str();
        let kind = if body.contains("splice(") {
            HelperKind::Splice
        } else if body.contains("reverse(") {
            HelperKind::Reverse
        } else if body.contains('%') {
            HelperKind::Swap
        } else {
            continue;
        };
        out.push((name, kind));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A miniature player script exercising all three helper ops plus an
    /// inline-op n routine and the modern n dispatch site.
    const FIXTURE: &str = r#"
var something=1;function unrelated(x){return x+1}
var Wk={c9:function(a){a.reverse()},J2:function(a,b){a.splice(0,b)},d0:function(a,b){var c=a[0];a[0]=a[b%a.length];a[b%a.length]=c}};
var dec=function(a){a=a.split("");Wk.J2(a,2);Wk.c9(a,0);Wk.d0(a,1);return a.join("")};
var nTr=function(a){a=a.split("");a.reverse();a.splice(0,1);return a.join("")};
var q=String.fromCharCode(103);c.get("n"))&&(e=nTr(f);
padding padding padding padding padding padding padding padding padding
"#;

    fn solve(script: &str) -> SolverPair {
        let pp = preprocess(script).expect("preprocess");
        extract(&pp).expect("extract")
    }

    #[test]
    fn preprocess_rejects_non_scripts() {
        assert!(matches!(
            preprocess("tiny"),
            Err(AnalyzerError::Malformed(_))
        ));
        let no_fn = "x".repeat(500);
        assert!(matches!(
            preprocess(&no_fn),
            Err(AnalyzerError::Malformed(_))
        ));
    }

    #[test]
    fn preprocess_is_deterministic() {
        assert_eq!(preprocess(FIXTURE).unwrap(), preprocess(FIXTURE).unwrap());
    }

    #[test]
    fn sig_solver_applies_splice_reverse_swap_in_order() {
        let pair = solve(FIXTURE);
        let sig = pair.sig.expect("sig solver");
        // "abcdef": splice(2) -> "cdef", reverse -> "fedc", swap(1) -> "efdc"
        assert_eq!(sig.apply("abcdef").unwrap(), "efdc");
    }

    #[test]
    fn n_solver_compiles_inline_ops() {
        let pair = solve(FIXTURE);
        let n = pair.n.expect("n solver");
        // "abcd": reverse -> "dcba", splice(1) -> "cba"
        assert_eq!(n.apply("abcd").unwrap(), "cba");
    }

    #[test]
    fn repeated_application_is_deterministic() {
        let pair = solve(FIXTURE);
        let sig = pair.sig.unwrap();
        assert_eq!(sig.apply("tokenXYZ").unwrap(), sig.apply("tokenXYZ").unwrap());
    }

    #[test]
    fn unknown_helper_vocabulary_yields_absent_solver() {
        let script = r#"
function filler(){return 1}
var Ob={weird:function(a,b){a.sort()}};
var dec=function(a){a=a.split("");Ob.weird(a,2);return a.join("")};
padding padding padding padding padding padding padding padding padding
"#;
        let pp = preprocess(script).unwrap();
        let pair = extract(&pp).unwrap();
        assert!(pair.sig.is_none());
    }

    #[test]
    fn script_without_transforms_produces_empty_pair() {
        let script = format!(
            "function nothing(a){{return a+2}} var x = 3; {}",
            "// filler ".repeat(20)
        );
        let pp = preprocess(&script).unwrap();
        let pair = extract(&pp).unwrap();
        assert!(pair.is_empty());
    }

    #[test]
    fn extract_rejects_garbage_documents() {
        assert!(matches!(
            extract("not json"),
            Err(AnalyzerError::InvalidDocument(_))
        ));
        assert!(matches!(
            extract(r#"{"version":99,"sig":null,"n":null}"#),
            Err(AnalyzerError::InvalidDocument(_))
        ));
    }

    #[test]
    fn solver_eval_edge_cases() {
        let s = Solver {
            ops: vec![TransformOp::Splice(10)],
        };
        assert_eq!(s.apply(""), Err(SolverEvalError::EmptyInput));
        // Splice beyond length drains everything.
        assert_eq!(s.apply("abc"), Err(SolverEvalError::EmptyResult));

        let identity = Solver::identity();
        assert_eq!(identity.apply("abc").unwrap(), "abc");
    }

    #[test]
    fn balanced_body_skips_braces_inside_strings() {
        let s = r#"{var x="}";y={a:1};}"#;
        let (start, end) = balanced_body(s, 0).unwrap();
        assert_eq!(&s[start..end], r#"var x="}";y={a:1};"#);
    }

    #[test]
    fn n_dispatch_alias_array_resolves() {
        let script = r#"
function filler(q){return q}
var realN=function(a){a=a.split("");a.reverse();return a.join("")};
var Alias=[realN];
x.get("n"))&&(b=Alias[0](c);
padding padding padding padding padding padding padding padding padding
"#;
        let pp = preprocess(script).unwrap();
        let pair = extract(&pp).unwrap();
        let n = pair.n.expect("aliased n solver");
        assert_eq!(n.apply("ab").unwrap(), "ba");
    }
}
