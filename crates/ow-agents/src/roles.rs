use ow_core::types::{
    truncate_chars, CriticOutput, ExecutorOutput, PlanOption, PlannerOutput, RiskClass,
};

use crate::task_agent::{AgentSpec, TaskAgent};

pub type PlannerAgent = TaskAgent<Planner>;
pub type CriticAgent = TaskAgent<Critic>;
pub type ExecutorAgent = TaskAgent<Executor>;

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

pub const PLANNER_SYSTEM_PROMPT: &str = r#"You are the PLANNER agent for Overwatch, a personal AI command center. Your job is to create actionable plans for the user's task.

For each task, generate 2-3 plan options with different approaches. For each option, specify:
1. A short label (e.g., "Quick Analysis", "Deep Dive", "Conservative")
2. Concrete steps (3-6 steps each)
3. Risk class: R0 (read-only), R1 (local write), R2 (external write), R3 (destructive), R4 (irreversible)
4. Estimated cost in USD (based on API calls needed)
5. Brief rationale

Also provide:
- Your recommended option index (0-based)
- Your reasoning for the recommendation

IMPORTANT: Be practical. This is one developer's personal assistant, not an enterprise system.

Respond in valid JSON only:
{
  "options": [
    {
      "label": "string",
      "steps": ["step 1", "step 2"],
      "riskClass": "R0|R1|R2|R3|R4",
      "estimatedCostUsd": 0.05,
      "rationale": "string"
    }
  ],
  "recommendedIndex": 0,
  "reasoning": "string"
}"#;

pub const CRITIC_SYSTEM_PROMPT: &str = r#"You are the CRITIC agent for Overwatch, a personal AI command center. You review plans created by the Planner agent (a DIFFERENT AI model).

Your job is ADVERSARIAL: actively look for flaws, risks, and issues. Be thorough but constructive.

Evaluate the plan on:
1. Feasibility: can this actually be done with the available tools?
2. Risk: are risk levels correctly assigned? Any hidden dangers?
3. Cost: is the estimated cost reasonable?
4. Completeness: are there missing steps or edge cases?
5. Safety: could any step cause data loss, privacy issues, or unintended side effects?

Respond in valid JSON only:
{
  "approved": true|false,
  "score": 0-10,
  "issues": ["issue 1", "issue 2"],
  "suggestions": ["suggestion 1"],
  "reasoning": "Overall assessment"
}

Score guide: 0-3 reject, 4-6 needs work, 7-8 good, 9-10 excellent.
Approve if score >= 5 and no critical issues."#;

pub const EXECUTOR_SYSTEM_PROMPT: &str = r#"You are the EXECUTOR agent for Overwatch, a personal AI command center. You execute approved plans.

Your capabilities:
- Analyze code and provide insights
- Generate suggestions and recommendations
- Create summaries and documentation
- Propose GitHub issues and PR descriptions
- Search and synthesize knowledge from provided context

Your limitations (STRICT, do NOT attempt):
- NO filesystem writes or reads
- NO shell command execution
- NO git operations
- NO API calls to external services
- NO database modifications

For each step in the plan, describe what you did and any output/artifacts produced.

Respond in valid JSON only:
{
  "result": "Summary of what was accomplished",
  "actions": ["action 1 completed", "action 2 completed"],
  "artifacts": ["artifact description 1"]
}"#;

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

/// Proposes 2-3 plan options and recommends one.
pub struct Planner;

/// Optional background appended to the planner's user message.
#[derive(Debug, Clone, Default)]
pub struct PlannerInput {
    pub extra_context: Option<String>,
}

impl AgentSpec for Planner {
    type Input = PlannerInput;
    type Output = PlannerOutput;

    const NAME: &'static str = "planner";
    const LABEL: &'static str = "Planner";
    const TASK_TYPE: &'static str = "plan";
    const ACTION: &'static str = "generate_plan";

    fn system_prompt() -> &'static str {
        PLANNER_SYSTEM_PROMPT
    }

    fn risk_class(_input: &PlannerInput) -> RiskClass {
        RiskClass::R0
    }

    fn user_message(task: &str, input: &PlannerInput) -> String {
        let mut msg = format!("Task: {task}");
        if let Some(extra) = &input.extra_context {
            msg.push_str("\n\nRelevant context:\n");
            msg.push_str(extra);
        }
        msg
    }

    fn run_input(task: &str, input: &PlannerInput) -> serde_json::Value {
        serde_json::json!({
            "taskDescription": task,
            "extraContext": input.extra_context.as_deref().map(|c| truncate_chars(c, 500)),
        })
    }

    fn validate(output: &PlannerOutput) -> Result<(), String> {
        if output.options.is_empty() {
            return Err("no plan options".into());
        }
        if output.recommended_index >= output.options.len() {
            return Err(format!(
                "recommendedIndex {} out of range for {} options",
                output.recommended_index,
                output.options.len()
            ));
        }
        Ok(())
    }

    fn output_summary(output: &PlannerOutput) -> String {
        let label = output.recommended().map(|o| o.label.as_str()).unwrap_or("none");
        format!("{} options, recommended: {}", output.options.len(), label)
    }
}

// ---------------------------------------------------------------------------
// Critic
// ---------------------------------------------------------------------------

/// Adversarially reviews a plan, ideally on a different model provider.
pub struct Critic;

impl AgentSpec for Critic {
    type Input = PlannerOutput;
    type Output = CriticOutput;

    const NAME: &'static str = "critic";
    const LABEL: &'static str = "Critic";
    const TASK_TYPE: &'static str = "review";
    const ACTION: &'static str = "review_plan";

    fn system_prompt() -> &'static str {
        CRITIC_SYSTEM_PROMPT
    }

    fn risk_class(_plan: &PlannerOutput) -> RiskClass {
        RiskClass::R0
    }

    fn user_message(task: &str, plan: &PlannerOutput) -> String {
        let options = plan
            .options
            .iter()
            .enumerate()
            .map(|(i, opt)| {
                let marker = if i == plan.recommended_index {
                    " [RECOMMENDED]"
                } else {
                    ""
                };
                format!(
                    "Option {}: {}{} ({}, ${:.3})\nSteps: {}\nRationale: {}",
                    i + 1,
                    opt.label,
                    marker,
                    opt.risk_class,
                    opt.estimated_cost_usd,
                    opt.steps.join(" → "),
                    opt.rationale
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        format!(
            "Task: {task}\n\nPlanner's recommendation: Option {}\nPlanner's reasoning: {}\n\n--- PLAN OPTIONS ---\n{options}",
            plan.recommended_index + 1,
            plan.reasoning
        )
    }

    fn run_input(task: &str, plan: &PlannerOutput) -> serde_json::Value {
        serde_json::json!({
            "taskDescription": task,
            "optionCount": plan.options.len(),
        })
    }

    fn validate(output: &CriticOutput) -> Result<(), String> {
        if !output.score.is_finite() || !(0.0..=10.0).contains(&output.score) {
            return Err(format!("score {} outside 0-10", output.score));
        }
        Ok(())
    }

    fn output_summary(output: &CriticOutput) -> String {
        format!(
            "Score: {}/10, Approved: {}, Issues: {}",
            output.score,
            output.approved,
            output.issues.len()
        )
    }

    fn decision(output: &CriticOutput) -> &'static str {
        if output.approved {
            "auto_approved"
        } else {
            "denied"
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Carries out the selected plan option.
pub struct Executor;

impl AgentSpec for Executor {
    type Input = PlanOption;
    type Output = ExecutorOutput;

    const NAME: &'static str = "executor";
    const LABEL: &'static str = "Executor";
    const TASK_TYPE: &'static str = "execute";
    const ACTION: &'static str = "execute_plan";

    fn system_prompt() -> &'static str {
        EXECUTOR_SYSTEM_PROMPT
    }

    fn risk_class(option: &PlanOption) -> RiskClass {
        option.risk_class
    }

    fn user_message(task: &str, option: &PlanOption) -> String {
        let steps = option
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{}. {}", i + 1, s))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "Task: {task}\n\nApproved plan: {}\nRisk class: {}\n\nSteps to execute:\n{steps}\n\nExecute each step and report results.",
            option.label, option.risk_class
        )
    }

    fn run_input(task: &str, option: &PlanOption) -> serde_json::Value {
        serde_json::json!({
            "taskDescription": task,
            "selectedOption": option.label,
            "steps": option.steps,
        })
    }

    fn input_summary(task: &str, option: &PlanOption) -> String {
        format!("{}: {}", option.label, truncate_chars(task, 80))
    }

    fn output_summary(output: &ExecutorOutput) -> String {
        format!(
            "{} actions, {} artifacts",
            output.actions.len(),
            output.artifacts.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn option(label: &str, risk: RiskClass) -> PlanOption {
        PlanOption {
            label: label.into(),
            steps: vec!["read config".into(), "summarise".into()],
            risk_class: risk,
            estimated_cost_usd: 0.02,
            rationale: "cheap".into(),
        }
    }

    fn plan() -> PlannerOutput {
        PlannerOutput {
            options: vec![option("Quick", RiskClass::R0), option("Thorough", RiskClass::R1)],
            recommended_index: 1,
            reasoning: "more complete".into(),
        }
    }

    #[test]
    fn planner_message_includes_extra_context() {
        let plain = Planner::user_message("audit deps", &PlannerInput::default());
        assert_eq!(plain, "Task: audit deps");
        let with_ctx = Planner::user_message(
            "audit deps",
            &PlannerInput {
                extra_context: Some("uses cargo".into()),
            },
        );
        assert!(with_ctx.ends_with("Relevant context:\nuses cargo"));
    }

    #[test]
    fn planner_rejects_out_of_range_recommendation() {
        let mut p = plan();
        assert!(Planner::validate(&p).is_ok());
        p.recommended_index = 2;
        assert!(Planner::validate(&p).unwrap_err().contains("out of range"));
        p.options.clear();
        p.recommended_index = 0;
        assert_eq!(Planner::validate(&p).unwrap_err(), "no plan options");
    }

    #[test]
    fn planner_summary_names_recommendation() {
        assert_eq!(
            Planner::output_summary(&plan()),
            "2 options, recommended: Thorough"
        );
    }

    #[test]
    fn critic_message_marks_recommended_option() {
        let msg = Critic::user_message("audit deps", &plan());
        assert!(msg.contains("Planner's recommendation: Option 2"));
        assert!(msg.contains("Option 2: Thorough [RECOMMENDED] (R1, $0.020)"));
        assert!(msg.contains("Option 1: Quick (R0, $0.020)"));
        assert!(msg.contains("Steps: read config → summarise"));
        assert!(msg.contains("--- PLAN OPTIONS ---"));
    }

    #[test]
    fn critic_score_bounds() {
        let mut review = CriticOutput {
            approved: true,
            score: 7.0,
            issues: vec![],
            suggestions: vec![],
            reasoning: "ok".into(),
        };
        assert!(Critic::validate(&review).is_ok());
        review.score = 11.0;
        assert!(Critic::validate(&review).is_err());
        review.score = -1.0;
        assert!(Critic::validate(&review).is_err());
    }

    #[test]
    fn critic_decision_follows_approval() {
        let review = CriticOutput {
            approved: false,
            score: 4.0,
            issues: vec!["a".into()],
            suggestions: vec![],
            reasoning: "meh".into(),
        };
        assert_eq!(Critic::decision(&review), "denied");
        assert_eq!(
            Critic::output_summary(&review),
            "Score: 4/10, Approved: false, Issues: 1"
        );
    }

    #[test]
    fn executor_message_numbers_steps() {
        let msg = Executor::user_message("audit deps", &option("Quick", RiskClass::R0));
        assert!(msg.contains("Approved plan: Quick\nRisk class: R0"));
        assert!(msg.contains("1. read config\n2. summarise"));
        assert!(msg.ends_with("Execute each step and report results."));
    }

    #[test]
    fn executor_summary_prefixes_label() {
        let long_task = "x".repeat(200);
        let summary = Executor::input_summary(&long_task, &option("Quick", RiskClass::R2));
        assert_eq!(summary.len(), "Quick: ".len() + 80);
        assert_eq!(Executor::risk_class(&option("Q", RiskClass::R2)), RiskClass::R2);
    }
}
