//! Prompt fragments shared by the role strategies.

/// How a model must format its reply so the runtime can act on it.
pub const ACTION_PROTOCOL: &str = "\
Each reply must contain exactly one action block:
- <execute>python code</execute> runs Python in your persistent namespace. Variables \
survive between snippets; print what you need to see.
- <tool_call>{\"name\": \"...\", \"arguments\": {...}}</tool_call> invokes one of the tools below.
- <final_result>...</final_result> ends the task with your answer.
You may reason inside <think>...</think> first; it is ignored.";

/// Variant of [`ACTION_PROTOCOL`] for roles without code execution.
pub const TOOL_ONLY_PROTOCOL: &str = "\
Each reply must contain exactly one action block:
- <tool_call>{\"name\": \"...\", \"arguments\": {...}}</tool_call> invokes one of the tools below.
- <final_result>...</final_result> or <report>...</report> ends the task with your answer.
You may reason inside <think>...</think> first; it is ignored.";

/// Role introduction, action protocol and tool catalog in one system prompt.
pub(crate) fn compose(intro: &str, protocol: &str, capabilities: &str) -> String {
    let tools = if capabilities.trim().is_empty() {
        "(no tools available)"
    } else {
        capabilities
    };
    format!("{intro}\n\n{protocol}\n\nAvailable tools:\n{tools}")
}
