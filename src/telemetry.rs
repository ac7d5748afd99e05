// Pure NDJSON telemetry extraction (§4.2). No I/O, no allocation beyond
// what's needed to walk lines backward.
use crate::models::Telemetry;

/// Scan `body` from the end backward for the first line that carries a
/// telemetry field or `"done": true`, and pull token counts / phase
/// durations from it. Nanosecond duration fields are converted to ms.
/// Never panics; unparsable or missing input yields all zeros.
pub fn extract(body: &[u8]) -> Telemetry {
    let text = match std::str::from_utf8(body) {
        Ok(t) => t,
        Err(_) => return Telemetry::default(),
    };

    for line in text.lines().rev() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => continue,
        };

        let has_telemetry = value.get("prompt_eval_count").is_some()
            || value.get("eval_count").is_some()
            || value.get("prompt_eval_duration").is_some()
            || value.get("eval_duration").is_some();
        let is_done = value.get("done").and_then(|d| d.as_bool()).unwrap_or(false);

        if !has_telemetry && !is_done {
            continue;
        }

        let prompt_tokens = value.get("prompt_eval_count").and_then(|v| v.as_i64()).unwrap_or(0);
        let completion_tokens = value.get("eval_count").and_then(|v| v.as_i64()).unwrap_or(0);
        let prompt_eval_duration_ms =
            value.get("prompt_eval_duration").and_then(|v| v.as_i64()).unwrap_or(0) / 1_000_000;
        let eval_duration_ms =
            value.get("eval_duration").and_then(|v| v.as_i64()).unwrap_or(0) / 1_000_000;

        return Telemetry {
            prompt_tokens,
            completion_tokens,
            prompt_eval_duration_ms,
            eval_duration_ms,
        };
    }

    Telemetry::default()
}

/// Parse the `model` field from a request JSON body, defaulting to
/// `"unknown"` on any parse failure or missing/non-string field (§3).
pub fn extract_model(body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("model").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_object_is_extracted() {
        let body = concat!(
            "{\"response\":\"a\",\"done\":false}\n",
            "{\"response\":\"b\",\"done\":false}\n",
            "{\"response\":\"c\",\"done\":false}\n",
            "{\"done\":true,\"prompt_eval_count\":5,\"eval_count\":7,",
            "\"prompt_eval_duration\":200000000,\"eval_duration\":400000000}\n",
        );
        let t = extract(body.as_bytes());
        assert_eq!(t.prompt_tokens, 5);
        assert_eq!(t.completion_tokens, 7);
        assert_eq!(t.prompt_eval_duration_ms, 200);
        assert_eq!(t.eval_duration_ms, 400);
    }

    #[test]
    fn no_summary_yields_zeros() {
        let body = "{\"response\":\"a\",\"done\":false}\n{\"response\":\"b\",\"done\":false}\n";
        assert_eq!(extract(body.as_bytes()), Telemetry::default());
    }

    #[test]
    fn empty_body_yields_zeros() {
        assert_eq!(extract(b""), Telemetry::default());
    }

    #[test]
    fn garbage_lines_are_skipped() {
        let body = concat!(
            "not json at all\n",
            "{\"response\":\"a\"}\n",
            "}}} malformed\n",
            "{\"done\":true,\"eval_count\":3}\n",
        );
        let t = extract(body.as_bytes());
        assert_eq!(t.completion_tokens, 3);
        assert_eq!(t.prompt_tokens, 0);
    }

    #[test]
    fn single_json_object_body_works() {
        let body = "{\"done\":true,\"prompt_eval_count\":1,\"eval_count\":2,\"prompt_eval_duration\":1000000,\"eval_duration\":2000000}";
        let t = extract(body.as_bytes());
        assert_eq!(t.prompt_tokens, 1);
        assert_eq!(t.completion_tokens, 2);
        assert_eq!(t.prompt_eval_duration_ms, 1);
        assert_eq!(t.eval_duration_ms, 2);
    }

    #[test]
    fn model_field_is_parsed() {
        assert_eq!(extract_model(br#"{"model":"llama3","prompt":"hi"}"#), "llama3");
    }

    #[test]
    fn missing_model_defaults_to_unknown() {
        assert_eq!(extract_model(br#"{"prompt":"hi"}"#), "unknown");
    }

    #[test]
    fn unparsable_body_defaults_to_unknown() {
        assert_eq!(extract_model(b"not json"), "unknown");
    }
}
