use crate::archive::TurnArchive;
use saga_common::Turn;

/// Prefix `base_prompt` with the scheduled archive context, if any.
///
/// When the archive has nothing to inject this turn the prompt is returned
/// unchanged. Otherwise the context and the original prompt are wrapped in
/// fixed section markers, with the prompt last and untouched.
///
/// Injecting consumes the archive's current bucket: a second call in the
/// same bucket (for a retried or rebuilt prompt, say) returns `base_prompt`
/// without context.
pub fn inject_archive_to_prompt(
    archive: &mut TurnArchive,
    turn: Turn,
    base_prompt: &str,
) -> String {
    let Some(context) = archive.get_context_for_prompt(turn) else {
        return base_prompt.to_string();
    };
    let through = archive.latest_checkpoint().unwrap_or(turn);
    format!(
        "=== HISTORICAL CONTEXT (turns 1-{through}) ===\n{context}\n\n\
         === CURRENT SITUATION (turn {turn}) ===\n{base_prompt}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArchiveConfig;
    use saga_common::{Map, SessionId, Value};

    fn archive_through(turns: Turn) -> TurnArchive {
        let mut archive = TurnArchive::new(
            SessionId::from("s"),
            ArchiveConfig {
                auto_compact_bytes: None,
                ..ArchiveConfig::default()
            },
        );
        for t in 1..=turns {
            let mut state = Map::new();
            state.insert("threat_level".into(), Value::from(t as f64));
            archive.record_turn(t, &state, &Map::new());
        }
        archive
    }

    #[test]
    fn prompt_unchanged_without_context() {
        let mut archive = archive_through(5);
        assert_eq!(
            inject_archive_to_prompt(&mut archive, 5, "Describe the harbor."),
            "Describe the harbor."
        );
    }

    #[test]
    fn context_wraps_prompt() {
        let mut archive = archive_through(12);
        let prompt = "Line one.\nLine two.";
        let out = inject_archive_to_prompt(&mut archive, 12, prompt);
        assert!(out.starts_with(
            "=== HISTORICAL CONTEXT (turns 1-10) ===\nARCHIVE SUMMARY @ turn 10"
        ));
        assert!(out.contains("=== CURRENT SITUATION (turn 12) ===\n"));
        assert!(out.ends_with(prompt));

        // Same bucket: no second injection, even for the same turn.
        assert_eq!(inject_archive_to_prompt(&mut archive, 12, prompt), prompt);
        assert_eq!(inject_archive_to_prompt(&mut archive, 13, prompt), prompt);
    }
}
