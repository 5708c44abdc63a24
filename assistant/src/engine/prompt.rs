// Prompt templates (model-specific formatting)

/// Opens a turn in the Gemma chat format
pub const TURN_START: &str = "<start_of_turn>";

/// Closes a turn in the Gemma chat format
pub const TURN_END: &str = "<end_of_turn>";

/// Opening of the model's turn; every prompt ends with it so the runtime
/// continues as the assistant
pub const ASSISTANT_TURN_OPEN: &str = "<start_of_turn>model\n";

/// Safety preamble sent with every request. Not user-editable.
pub const SYSTEM_PROMPT: &str = "\
Du bist ein medizinischer Assistent.
Antworte sachlich, vorsichtig und ohne Diagnosen zu stellen.
Gib keine medizinischen Ratschläge, die einen Arztbesuch ersetzen könnten.";

/// Gemma has no system role; the instruction rides in the user turn
pub const CHAT_TEMPLATE: &str = "\
<start_of_turn>user
{system_prompt}

{user_prompt}<end_of_turn>
<start_of_turn>model
";

/// Render the system instruction and a user message as a Gemma prompt.
///
/// Any input, including the empty string, yields a well-formed prompt.
pub fn format_prompt(user_message: &str) -> String {
    // System prompt first so text inside the user message is never treated as a placeholder
    CHAT_TEMPLATE
        .replacen("{system_prompt}", SYSTEM_PROMPT, 1)
        .replacen("{user_prompt}", user_message, 1)
}
