//! Agent prompt composition.
//!
//! Prompt fragments are prioritized, conditionally included contracts. The
//! composer sorts by priority (then name, so equal priorities stay
//! deterministic), drops fragments whose predicate rejects the context,
//! and joins the rendered survivors.

/// Facts a fragment can render from.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub project_name: String,
    pub project_prompt: Option<String>,
    pub session_id: String,
    pub session_title: Option<String>,
    pub workspace_dir: String,
}

/// One prompt fragment: included when `applies` accepts the context.
pub struct PromptFragment {
    pub name: &'static str,
    pub priority: i32,
    pub applies: fn(&PromptContext) -> bool,
    pub render: fn(&PromptContext) -> String,
}

/// Compose the fragments that apply, highest priority first.
pub fn compose(fragments: &[PromptFragment], ctx: &PromptContext) -> String {
    let mut applicable: Vec<&PromptFragment> =
        fragments.iter().filter(|f| (f.applies)(ctx)).collect();
    applicable.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.name.cmp(b.name)));

    applicable
        .iter()
        .map(|f| (f.render)(ctx))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// The default fragment set for session agents.
pub fn session_fragments() -> Vec<PromptFragment> {
    vec![
        PromptFragment {
            name: "project-prompt",
            priority: 100,
            applies: |ctx| ctx.project_prompt.is_some(),
            render: |ctx| ctx.project_prompt.clone().unwrap_or_default(),
        },
        PromptFragment {
            name: "workspace",
            priority: 50,
            applies: |_| true,
            render: |ctx| {
                format!(
                    "You are working in project \"{}\". The workspace directory is {}.",
                    ctx.project_name, ctx.workspace_dir
                )
            },
        },
        PromptFragment {
            name: "task",
            priority: 40,
            applies: |ctx| ctx.session_title.is_some(),
            render: |ctx| {
                format!(
                    "The user's task: {}",
                    ctx.session_title.clone().unwrap_or_default()
                )
            },
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(title: Option<&str>, prompt: Option<&str>) -> PromptContext {
        PromptContext {
            project_name: "web".to_string(),
            project_prompt: prompt.map(str::to_string),
            session_id: "s1".to_string(),
            session_title: title.map(str::to_string),
            workspace_dir: "/workspaces/s1".to_string(),
        }
    }

    #[test]
    fn composition_is_deterministic_and_ordered() {
        let fragments = session_fragments();
        let a = compose(&fragments, &ctx(Some("fix login"), Some("be terse")));
        let b = compose(&fragments, &ctx(Some("fix login"), Some("be terse")));
        assert_eq!(a, b);

        // Project prompt (priority 100) leads, task trails.
        assert!(a.starts_with("be terse"));
        assert!(a.ends_with("The user's task: fix login"));
    }

    #[test]
    fn predicates_gate_fragments() {
        let fragments = session_fragments();
        let rendered = compose(&fragments, &ctx(None, None));
        assert!(!rendered.contains("task"));
        assert!(rendered.contains("workspace directory"));
    }

    #[test]
    fn equal_priorities_break_ties_by_name() {
        let fragments = vec![
            PromptFragment {
                name: "b",
                priority: 10,
                applies: |_| true,
                render: |_| "second".to_string(),
            },
            PromptFragment {
                name: "a",
                priority: 10,
                applies: |_| true,
                render: |_| "first".to_string(),
            },
        ];
        assert_eq!(compose(&fragments, &ctx(None, None)), "first\n\nsecond");
    }
}
