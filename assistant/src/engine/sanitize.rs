// Removes chat-format artifacts (turn markers, role prefixes) from model output

use super::prompt::{TURN_END, TURN_START};

/// Role words the model sometimes echoes at the start of its turn
const ROLE_PREFIXES: [&str; 3] = ["user", "model", "assistant"];

/// Clean raw model output for display.
///
/// Turn markers are removed wherever they occur (streamed output can
/// interleave them), a leading role prefix such as `model\n` or
/// `Assistant:` is stripped, and surrounding whitespace is trimmed.
/// Applying it twice gives the same result as applying it once.
pub fn clean_output(raw: &str) -> String {
    let mut text = strip_markers(raw);
    loop {
        let trimmed = text.trim();
        match strip_role_prefix(trimmed) {
            Some(rest) => text = strip_markers(rest),
            None => return trimmed.to_string(),
        }
    }
}

/// Removing one marker can join the halves of another, so repeat until none is left
fn strip_markers(text: &str) -> String {
    let mut result = text.to_string();
    while result.contains(TURN_START) || result.contains(TURN_END) {
        result = result.replace(TURN_END, "").replace(TURN_START, "");
    }
    result
}

/// `user\n`, `Model:`, `ASSISTANT:` etc. Bare words are kept ("username" is not a prefix).
fn strip_role_prefix(text: &str) -> Option<&str> {
    ROLE_PREFIXES.iter().find_map(|role| {
        let head = text.get(..role.len())?;
        if !head.eq_ignore_ascii_case(role) {
            return None;
        }
        let rest = &text[role.len()..];
        rest.strip_prefix(':')
            .or_else(|| rest.strip_prefix("\r\n"))
            .or_else(|| rest.strip_prefix('\n'))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_markers_and_model_prefix() {
        assert_eq!(clean_output("<start_of_turn>model\nHello<end_of_turn>"), "Hello");
    }

    #[test]
    fn test_strips_case_insensitive_prefixes() {
        assert_eq!(clean_output("Assistant: Bitte trinken Sie genug."), "Bitte trinken Sie genug.");
        assert_eq!(clean_output("USER:hi"), "hi");
        assert_eq!(clean_output("  model\nText  "), "Text");
    }

    #[test]
    fn test_markers_removed_inside_text() {
        assert_eq!(
            clean_output("Erste<end_of_turn> Zeile<start_of_turn> weiter"),
            "Erste Zeile weiter"
        );
    }

    #[test]
    fn test_word_starting_with_role_is_kept() {
        assert_eq!(clean_output("username vergessen"), "username vergessen");
        assert_eq!(clean_output("Modeller"), "Modeller");
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(clean_output(""), "");
        assert_eq!(clean_output("<end_of_turn>"), "");
    }

    #[test]
    fn test_nested_markers_do_not_survive() {
        assert_eq!(clean_output("<end_<start_of_turn>of_turn>ok"), "ok");
    }

    #[test]
    fn test_idempotent() {
        let samples = [
            "<start_of_turn>model\nHello<end_of_turn>",
            "user\nuser\nHallo",
            "model\n<start_of_turn>user:  x",
            "<end_<start_of_turn>of_turn>model:",
            "   \n  ",
            "Assistant:\r\nÜbelkeit kann viele Ursachen haben.",
            "Modell",
            "ünïcödé<end_of_turn>",
        ];
        for sample in samples {
            let once = clean_output(sample);
            assert_eq!(clean_output(&once), once, "not idempotent for {:?}", sample);
        }
    }
}
