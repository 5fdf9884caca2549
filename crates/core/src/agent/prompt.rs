use std::fmt::Write;

use crate::planner::Plan;

/// The system prompt used unless the builder overrides it.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. When \
you need to perform actions (search, read files, etc.), use the provided \
tools. Reply in the same language as the user when appropriate.";

/// Builds the user message that opens plan step `index`.
pub(crate) fn step_instruction(
    plan: &Plan,
    index: usize,
    previous: Option<&str>,
) -> String {
    let steps = plan.steps();
    let step = &steps[index];
    let mut text = String::new();

    if let Some(previous) = previous {
        writeln!(
            text,
            "Result of the previous step (use this result for the current \
             step):\n{previous}\n"
        )
        .ok();
    }

    writeln!(
        text,
        "Step {} of {}: {}",
        index + 1,
        steps.len(),
        step.description
    )
    .ok();
    if let Some(server) = &step.server {
        writeln!(text, "Use only the tools of {server} for this step.").ok();
    }

    let later = &steps[index + 1..];
    if later.is_empty() {
        text.push_str("This is the last step. Reply with the final answer.");
    } else {
        text.push_str(
            "Only perform this step. Do not start any of these later steps \
             yet:",
        );
        for (offset, step) in later.iter().enumerate() {
            write!(text, "\n{}. {}", index + offset + 2, step.description).ok();
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::PlanStep;

    #[test]
    fn test_step_instruction() {
        let plan = Plan::new(vec![
            PlanStep::new("search files"),
            PlanStep::new("summarize").pinned("notes"),
            PlanStep::new("email the summary"),
        ]);

        let first = step_instruction(&plan, 0, None);
        assert!(first.starts_with("Step 1 of 3: search files"));
        assert!(first.contains("2. summarize\n3. email the summary"));

        let second = step_instruction(&plan, 1, Some("found 3 files"));
        assert!(second.contains("use this result"));
        assert!(second.contains("found 3 files"));
        assert!(second.contains("Use only the tools of notes"));
        assert!(!second.contains("2. summarize"));
        assert!(second.ends_with("3. email the summary"));

        let last = step_instruction(&plan, 2, Some("summary"));
        assert!(last.ends_with("Reply with the final answer."));
    }
}
