//! Feature extraction
//!
//! Deterministically maps an event to the numeric vector a model expects.
//! The artifact decides which columns exist and in what order; this module
//! knows how to derive each named column from event fields. Unknown column
//! names evaluate to 0 and unknown categorical values take the reserved
//! encoder code, so extraction never fails.

use crate::models::Event;

use super::artifact::Artifact;

/// Which configured indicators an event matched. Computed once per event
/// and shared by the extractor (indicator columns) and the ensemble
/// (score floor, taxonomy).
#[derive(Debug, Clone, Copy, Default)]
pub struct IndicatorHits {
    pub action: bool,
    pub path: bool,
    pub payload: bool,
}

impl IndicatorHits {
    /// Matches that trigger the score floor.
    pub fn floors(&self) -> bool {
        self.action || self.path
    }
}

/// Payload substrings treated as a tooling/malware hint.
const PAYLOAD_MARKERS: &[&str] =
    &["backdoor", "malicious", "exploit", "shell", "wget", "curl", "reverse", "miner"];

/// User-agent fragments of automated clients.
const AUTOMATION_MARKERS: &[&str] = &["curl", "wget", "python-requests", "go-http-client"];

pub fn indicator_hits(
    event: &Event,
    indicator_actions: &[String],
    indicator_paths: &[String],
) -> IndicatorHits {
    let action = indicator_actions.iter().any(|a| event.action == *a);

    let path = event.target_path.as_deref().is_some_and(|p| {
        let p = p.to_lowercase();
        indicator_paths
            .iter()
            .any(|pat| p.contains(pat.trim_end_matches('*').to_lowercase().as_str()))
    });

    let payload = {
        let lower = event.payload_json.to_lowercase();
        PAYLOAD_MARKERS.iter().any(|m| lower.contains(m))
    };

    IndicatorHits { action, path, payload }
}

/// Produce the feature vector for one model: derive each named column,
/// standardize, then apply the artifact's feature selector.
pub fn featurize(event: &Event, hits: &IndicatorHits, artifact: &Artifact) -> Vec<f64> {
    let ctx = Derivation::new(event, hits);

    let mut x: Vec<f64> = artifact
        .columns
        .iter()
        .map(|column| match artifact.encoders.get(column) {
            Some(table) => {
                let key = match column.as_str() {
                    "proto" => event.protocol.as_str(),
                    "service" => event.target_service.as_str(),
                    // Flow state is not observable at the honeypot surface.
                    "state" => "ESTABLISHED",
                    _ => "",
                };
                table.get(key).copied().unwrap_or_else(|| Artifact::unknown_code(table))
            }
            None => ctx.numeric(column),
        })
        .collect();

    if let Some(scaler) = &artifact.scaler {
        for (i, value) in x.iter_mut().enumerate() {
            let scale = scaler.scale[i];
            if scale.abs() > f64::EPSILON {
                *value = (*value - scaler.mean[i]) / scale;
            }
        }
    }

    if let Some(selected) = &artifact.selected {
        x = selected.iter().filter_map(|&i| x.get(i).copied()).collect();
    }

    x
}

/// Per-event derivation state for the numeric columns. Flow-level values
/// the honeypot cannot observe are synthesized the same way the training
/// data synthesized them, conditioned on whether the event looks hostile.
struct Derivation {
    payload_len: f64,
    header_len: f64,
    ua_len: f64,
    service_len: f64,
    dur: f64,
    sbytes: f64,
    dbytes: f64,
    spkts: f64,
    dpkts: f64,
    sttl: f64,
    is_encrypted: f64,
    ua_automation: f64,
    is_file_access: f64,
    hits: IndicatorHits,
    suspicious: bool,
}

impl Derivation {
    fn new(event: &Event, hits: &IndicatorHits) -> Self {
        let suspicious = hits.floors()
            || hits.payload
            || ["bruteforce", "malformed", "scan"].iter().any(|m| event.action.contains(m));

        let payload_len = event.payload_json.len() as f64;
        let header_len = serde_json::to_string(&event.headers)
            .map(|s| s.len() as f64)
            .unwrap_or(0.0);

        let ua = event.user_agent.as_deref().unwrap_or("");
        let ua_lower = ua.to_lowercase();

        Self {
            payload_len,
            header_len,
            ua_len: ua.len() as f64,
            service_len: event.target_service.len() as f64,
            dur: if suspicious { 0.1 } else { 1.0 },
            sbytes: payload_len * if suspicious { 100.0 } else { 10.0 },
            dbytes: header_len * if suspicious { 50.0 } else { 5.0 },
            spkts: if suspicious { 100.0 } else { 10.0 },
            dpkts: if suspicious { 50.0 } else { 5.0 },
            sttl: if suspicious { 32.0 } else { 64.0 },
            is_encrypted: if event.protocol.eq_ignore_ascii_case("https") { 1.0 } else { 0.0 },
            ua_automation: if AUTOMATION_MARKERS.iter().any(|m| ua_lower.contains(m)) {
                1.0
            } else {
                0.0
            },
            is_file_access: if event.action == "file_access" { 1.0 } else { 0.0 },
            hits: *hits,
            suspicious,
        }
    }

    fn numeric(&self, column: &str) -> f64 {
        match column {
            "dur" => self.dur,
            "sbytes" => self.sbytes,
            "dbytes" => self.dbytes,
            "spkts" => self.spkts,
            "dpkts" => self.dpkts,
            "rate" | "sload" => self.sbytes / self.dur,
            "dload" => self.dbytes / self.dur,
            "sttl" | "dttl" => self.sttl,
            "sloss" | "dloss" => 0.0,
            "sinpkt" => self.dur / self.spkts,
            "dinpkt" => self.dur / self.dpkts,
            "sjit" | "djit" => 0.001,
            "swin" | "dwin" => 65535.0,
            "stcpb" | "dtcpb" => 0.0,
            "tcprtt" | "synack" | "ackdat" => 0.01,
            "smean" => self.sbytes / self.spkts,
            "dmean" => self.dbytes / self.dpkts,
            "trans_depth" => 1.0,
            "response_body_len" => self.dbytes,
            "ct_srv_src" | "ct_state_ttl" | "ct_dst_ltm" | "ct_src_dport_ltm"
            | "ct_dst_sport_ltm" | "ct_dst_src_ltm" | "ct_src_ltm" | "ct_srv_dst" => 1.0,
            "is_ftp_login" | "ct_ftp_cmd" | "ct_flw_http_mthd" | "is_sm_ips_ports" => 0.0,

            // Designated indicator columns (heuristic augmentation).
            "indicator_action" => self.hits.action as i64 as f64,
            "indicator_path" => self.hits.path as i64 as f64,
            "indicator_payload" => self.hits.payload as i64 as f64,
            "suspicious" => self.suspicious as i64 as f64,

            // Surface-derived columns used by the traffic classifier.
            "payload_len" => self.payload_len,
            "header_len" => self.header_len,
            "ua_len" => self.ua_len,
            "ua_automation" => self.ua_automation,
            "service_name_len" => self.service_len,
            "is_encrypted" => self.is_encrypted,
            "is_file_access" => self.is_file_access,

            // Missing numerics map to 0.
            _ => 0.0,
        }
    }
}
