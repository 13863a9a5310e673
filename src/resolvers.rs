//! The six resolver operations behind the HTTP surface.
//!
//! Each resolver takes a typed request, drives the registry pipeline, and
//! returns plain data; the HTTP layer owns envelopes, status codes and
//! headers. Solver evaluation failures inside `decrypt` degrade to empty
//! output fields (the response stays successful); everywhere else they
//! propagate.

use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Result, ServiceError};
use crate::metrics::Metrics;
use crate::player;
use crate::registry::SolverRegistry;
use crate::solver::SolverPair;

const STS_MAX: u64 = 9_999_999_999;

// ---------------------------------------------------------------------------
// Request shapes
// ---------------------------------------------------------------------------

/// Normalized request context threaded from the HTTP layer.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub started_at: Instant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptRequest {
    pub player_url: String,
    #[serde(default)]
    pub encrypted_signature: Option<String>,
    #[serde(default)]
    pub n_param: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StsRequest {
    pub player_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolveRequest {
    pub stream_url: String,
    pub player_url: String,
    #[serde(default)]
    pub encrypted_signature: Option<String>,
    #[serde(default)]
    pub signature_key: Option<String>,
    #[serde(default)]
    pub n_param: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidateRequest {
    pub encrypted_signature: String,
    pub player_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClearCacheRequest {
    #[serde(default)]
    pub cache_type: Option<String>,
    #[serde(default)]
    pub clear_all: Option<bool>,
}

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct DecryptResponse {
    pub decrypted_signature: String,
    pub decrypted_n_sig: String,
}

#[derive(Debug, Clone)]
pub struct StsOutcome {
    pub sts: String,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidateResponse {
    pub is_valid: bool,
    pub signature_type: &'static str,
    pub signature_length: usize,
    pub player_url_valid: bool,
    pub validation_details: ValidationDetails,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationDetails {
    pub length_valid: bool,
    pub characters_valid: bool,
    pub player_url_valid: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearOutcome {
    pub cleared_caches: Vec<&'static str>,
    pub cache_count: usize,
    pub clear_all: bool,
}

// ---------------------------------------------------------------------------
// Resolvers
// ---------------------------------------------------------------------------

pub struct Resolvers {
    registry: Arc<SolverRegistry>,
    metrics: Arc<Metrics>,
}

impl Resolvers {
    pub fn new(registry: Arc<SolverRegistry>, metrics: Arc<Metrics>) -> Self {
        Self { registry, metrics }
    }

    pub fn registry(&self) -> &Arc<SolverRegistry> {
        &self.registry
    }

    // -----------------------------------------------------------------------
    // decrypt
    // -----------------------------------------------------------------------

    pub async fn decrypt(&self, req: &DecryptRequest) -> Result<DecryptResponse> {
        let canonical = player::canonicalize(&req.player_url)?;
        let pair = self.registry.solvers_for(&canonical).await?;
        Ok(self.apply_pair(req, &pair))
    }

    /// Evaluate the pair against the request tokens. A throwing solver is
    /// logged and counted but the field degrades to an empty string; the
    /// overall call still succeeds.
    fn apply_pair(&self, req: &DecryptRequest, pair: &SolverPair) -> DecryptResponse {
        let decrypted_signature = match (&req.encrypted_signature, &pair.sig) {
            (Some(token), Some(solver)) => match solver.apply(token) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("[decrypt] sig solver failed: {e}");
                    self.metrics.errors_total.with(&["solver_eval"]).inc();
                    String::new()
                }
            },
            _ => String::new(),
        };

        let decrypted_n_sig = match (&req.n_param, &pair.n) {
            (Some(token), Some(solver)) => match solver.apply(token) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("[decrypt] n solver failed: {e}");
                    self.metrics.errors_total.with(&["solver_eval"]).inc();
                    String::new()
                }
            },
            _ => String::new(),
        };

        DecryptResponse {
            decrypted_signature,
            decrypted_n_sig,
        }
    }

    // -----------------------------------------------------------------------
    // sts
    // -----------------------------------------------------------------------

    pub async fn sts(&self, req: &StsRequest) -> Result<StsOutcome> {
        let canonical = player::canonicalize(&req.player_url)?;
        let fp = player::fingerprint(&canonical);

        if let Some(sts) = self.registry.sts.get(&fp) {
            return Ok(StsOutcome {
                sts,
                cache_hit: true,
            });
        }

        let store = self.registry.player_store();
        let path = store.path_for(&canonical).await?;
        let script = store.read_script(&path).await?;

        if script.len() < 1000 {
            return Err(ServiceError::internal(
                "INVALID_PLAYER_CONTENT",
                format!("player script is only {} bytes", script.len()),
            ));
        }

        let sts = scan_sts(&script)?;
        self.registry.sts.put(fp, sts.clone());
        Ok(StsOutcome {
            sts,
            cache_hit: false,
        })
    }

    // -----------------------------------------------------------------------
    // resolve
    // -----------------------------------------------------------------------

    pub async fn resolve(&self, req: &ResolveRequest) -> Result<String> {
        let canonical = player::canonicalize(&req.player_url)?;
        let pair = self.registry.solvers_for(&canonical).await?;
        rewrite_stream_url(req, &pair)
    }

    // -----------------------------------------------------------------------
    // batch
    // -----------------------------------------------------------------------

    /// Run each decrypt item independently; individual failures never fail
    /// the batch.
    pub async fn batch(&self, items: &[DecryptRequest]) -> (Vec<Value>, BatchSummary) {
        let mut results = Vec::with_capacity(items.len());
        let mut successful = 0usize;

        for (index, item) in items.iter().enumerate() {
            match self.decrypt(item).await {
                Ok(out) => {
                    successful += 1;
                    results.push(json!({
                        "index": index,
                        "success": true,
                        "player_url": item.player_url,
                        "encrypted_signature": item.encrypted_signature,
                        "n_param": item.n_param,
                        "decrypted_signature": out.decrypted_signature,
                        "decrypted_n_sig": out.decrypted_n_sig,
                    }));
                }
                Err(e) => {
                    results.push(json!({
                        "index": index,
                        "success": false,
                        "player_url": item.player_url,
                        "encrypted_signature": item.encrypted_signature,
                        "n_param": item.n_param,
                        "error": e.to_string(),
                        "code": e.code(),
                    }));
                }
            }
        }

        let summary = BatchSummary {
            total: items.len(),
            successful,
            failed: items.len() - successful,
        };
        (results, summary)
    }

    // -----------------------------------------------------------------------
    // validate
    // -----------------------------------------------------------------------

    /// Cheap heuristic check; never touches the registry.
    pub fn validate(&self, req: &ValidateRequest) -> ValidateResponse {
        validate_signature(req)
    }

    // -----------------------------------------------------------------------
    // clear_cache
    // -----------------------------------------------------------------------

    pub fn clear_cache(&self, req: &ClearCacheRequest) -> Result<ClearOutcome> {
        let clear_all = req.clear_all.unwrap_or(false);
        let target = if clear_all {
            "all".to_string()
        } else {
            match &req.cache_type {
                Some(t) => t.clone(),
                None => {
                    return Err(ServiceError::validation(
                        "INVALID_CACHE_TYPE",
                        "cache_type is required unless clear_all is true",
                    ));
                }
            }
        };

        let mut cleared: Vec<&'static str> = Vec::new();
        match target.as_str() {
            "all" => {
                self.registry.player_store().clear()?;
                self.registry.clear_memory_caches();
                cleared.extend(["player", "solver", "preprocessed", "sts"]);
            }
            "player" => {
                self.registry.player_store().clear()?;
                cleared.push("player");
            }
            "solver" => {
                self.registry.solvers.clear();
                cleared.push("solver");
            }
            "preprocessed" => {
                self.registry.preprocessed.clear();
                cleared.push("preprocessed");
            }
            "sts" => {
                self.registry.sts.clear();
                cleared.push("sts");
            }
            other => {
                return Err(ServiceError::validation(
                    "INVALID_CACHE_TYPE",
                    format!("unknown cache_type {other:?}"),
                ));
            }
        }

        tracing::info!("[cache] cleared: {}", cleared.join(", "));
        Ok(ClearOutcome {
            cache_count: cleared.len(),
            clear_all: target == "all",
            cleared_caches: cleared,
        })
    }
}

// ---------------------------------------------------------------------------
// STS scanning
// ---------------------------------------------------------------------------

/// Ordered pattern list, first match wins. Kept as separate expressions so
/// priority survives regex-engine quirks around alternation.
static STS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r#"(?:signatureTimestamp|sts):\s*(\d+)"#,
        r#""signatureTimestamp":\s*(\d+)"#,
        r#"'signatureTimestamp':\s*(\d+)"#,
        r#"signatureTimestamp\s*=\s*(\d+)"#,
        r#"sts\s*=\s*(\d+)"#,
        r#""sts":\s*(\d+)"#,
        r#"'sts':\s*(\d+)"#,
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Scan a player script for its signature timestamp.
pub fn scan_sts(script: &str) -> Result<String> {
    for pattern in STS_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(script) {
            let digits = caps.get(1).unwrap().as_str();
            let value: u64 = digits.parse().map_err(|_| {
                ServiceError::internal(
                    "INVALID_STS_VALUE",
                    format!("signature timestamp {digits:?} does not fit in range"),
                )
            })?;
            if value > STS_MAX {
                return Err(ServiceError::internal(
                    "INVALID_STS_VALUE",
                    format!("signature timestamp {value} exceeds {STS_MAX}"),
                ));
            }
            return Ok(value.to_string());
        }
    }
    Err(ServiceError::not_found(
        "STS_NOT_FOUND",
        "no signature timestamp pattern found in player script",
    ))
}

// ---------------------------------------------------------------------------
// Stream URL rewriting
// ---------------------------------------------------------------------------

/// Apply the pair to a stream URL: set the signature under `signature_key`
/// (dropping the encrypted `s`), and rewrite `n` when a transform exists.
pub fn rewrite_stream_url(req: &ResolveRequest, pair: &SolverPair) -> Result<String> {
    let mut parsed = url::Url::parse(&req.stream_url).map_err(|e| {
        ServiceError::validation("INVALID_STREAM_URL", format!("unparseable stream_url: {e}"))
    })?;

    if let Some(encrypted) = &req.encrypted_signature {
        let solver = pair.sig.as_ref().ok_or_else(|| {
            ServiceError::internal(
                "NO_SIGNATURE_SOLVER",
                "player has no signature transform but a signature was supplied",
            )
        })?;
        let decrypted = solver.apply(encrypted).map_err(|e| {
            ServiceError::internal("SOLVER_GENERATION_FAILED", format!("sig solver failed: {e}"))
        })?;
        let key = req.signature_key.as_deref().unwrap_or("sig");
        set_query_param(&mut parsed, key, &decrypted);
        remove_query_param(&mut parsed, "s");
    }

    // Prefer the body's n over whatever the URL already carries.
    let effective_n = req
        .n_param
        .clone()
        .or_else(|| query_param(&parsed, "n"));
    if let (Some(n_value), Some(solver)) = (effective_n, pair.n.as_ref()) {
        let decrypted = solver.apply(&n_value).map_err(|e| {
            ServiceError::internal("SOLVER_GENERATION_FAILED", format!("n solver failed: {e}"))
        })?;
        set_query_param(&mut parsed, "n", &decrypted);
    }

    Ok(parsed.to_string())
}

fn query_param(u: &url::Url, key: &str) -> Option<String> {
    u.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

fn set_query_param(u: &mut url::Url, key: &str, value: &str) {
    let kept: Vec<(String, String)> = u
        .query_pairs()
        .filter(|(k, _)| k != key)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut qp = u.query_pairs_mut();
    qp.clear();
    for (k, v) in &kept {
        qp.append_pair(k, v);
    }
    qp.append_pair(key, value);
}

fn remove_query_param(u: &mut url::Url, key: &str) {
    let kept: Vec<(String, String)> = u
        .query_pairs()
        .filter(|(k, _)| k != key)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        u.set_query(None);
        return;
    }
    let mut qp = u.query_pairs_mut();
    qp.clear();
    for (k, v) in &kept {
        qp.append_pair(k, v);
    }
}

// ---------------------------------------------------------------------------
// Signature validation heuristic
// ---------------------------------------------------------------------------

static SIG_CHARS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9+/=_-]+$").unwrap());

fn validate_signature(req: &ValidateRequest) -> ValidateResponse {
    let signature_length = req.encrypted_signature.chars().count();
    let length_valid = (10..=200).contains(&signature_length);
    let characters_valid = SIG_CHARS_RE.is_match(&req.encrypted_signature);
    let player_url_valid =
        req.player_url.contains("/s/player/") || req.player_url.contains("/yts/jsbin/");

    let signature_type = if !player_url_valid {
        "invalid_player_url"
    } else if signature_length <= 50 {
        "short"
    } else if signature_length <= 100 {
        "medium"
    } else {
        "long"
    };

    ValidateResponse {
        is_valid: length_valid && characters_valid && player_url_valid,
        signature_type,
        signature_length,
        player_url_valid,
        validation_details: ValidationDetails {
            length_valid,
            characters_valid,
            player_url_valid,
        },
    }
}
