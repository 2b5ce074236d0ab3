//! Conversation engine: the automation state machine.
//!
//! Pure: given the current stage, the accumulated context and the inbound
//! text, computes the next stage (or a transfer to a human), the new context
//! and the outbound intents. Persisting state, sending intents and forwarding
//! transfers is the caller's job.

use serde::Serialize;
use serde_json::Value;

use super::prompts;
use super::stage::Stage;
use crate::channels::MessageIntent;

/// Cumulative facts collected from a contact across turns.
pub type Context = serde_json::Map<String, Value>;

/// Keys the engine writes into the context.
pub mod context_keys {
    pub const NAME: &str = "name";
    pub const INTEREST: &str = "interest";
    pub const ISSUE: &str = "issue";
    pub const TRANSFER_REASON: &str = "transfer_reason";
    pub const DEPARTMENT: &str = "department";
}

/// Why and where a conversation is handed to a human.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Handoff {
    pub reason: String,
    pub department: Option<String>,
}

impl Handoff {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            department: None,
        }
    }

    pub fn to_department(mut self, department: impl Into<String>) -> Self {
        self.department = Some(department.into());
        self
    }
}

/// Where the conversation goes after a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Automation continues at this stage.
    Continue(Stage),
    /// Automation ends; the state record must be deleted.
    Transfer(Handoff),
}

/// Result of one engine step.
#[derive(Debug, Clone)]
pub struct Turn {
    pub outcome: TurnOutcome,
    pub context: Context,
    pub intents: Vec<MessageIntent>,
}

impl Turn {
    fn continue_at(stage: Stage, context: Context, intents: Vec<MessageIntent>) -> Self {
        Self {
            outcome: TurnOutcome::Continue(stage),
            context,
            intents,
        }
    }

    fn transfer(handoff: Handoff, mut context: Context) -> Self {
        remember(&mut context, context_keys::TRANSFER_REASON, &handoff.reason);
        if let Some(ref department) = handoff.department {
            remember(&mut context, context_keys::DEPARTMENT, department);
        }
        Self {
            outcome: TurnOutcome::Transfer(handoff),
            context,
            intents: Vec::new(),
        }
    }

    /// Next stage, or `None` when the turn transfers to a human.
    pub fn next_stage(&self) -> Option<Stage> {
        match self.outcome {
            TurnOutcome::Continue(stage) => Some(stage),
            TurnOutcome::Transfer(_) => None,
        }
    }

    pub fn transfer_to_human(&self) -> bool {
        matches!(self.outcome, TurnOutcome::Transfer(_))
    }

    pub fn handoff(&self) -> Option<&Handoff> {
        match self.outcome {
            TurnOutcome::Transfer(ref handoff) => Some(handoff),
            TurnOutcome::Continue(_) => None,
        }
    }
}

/// Add a fact to the context. Keys are only ever added or refreshed.
fn remember(context: &mut Context, key: &str, value: &str) {
    context.insert(key.to_string(), Value::String(value.to_string()));
}

/// The automation state machine. Stateless; one instance serves every contact.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConversationEngine;

impl ConversationEngine {
    pub fn new() -> Self {
        Self
    }

    /// Advance one turn for `phone`.
    pub fn advance(&self, stage: Stage, context: &Context, phone: &str, text: &str) -> Turn {
        let mut context = context.clone();
        let input = text.trim();
        let reply = |message: String| vec![MessageIntent::text(phone, message)];

        match stage {
            Stage::Start => {
                Turn::continue_at(Stage::AwaitingOption, context, reply(prompts::welcome()))
            }

            Stage::AwaitingOption => match input {
                "1" => Turn::continue_at(
                    Stage::CollectingNameProducts,
                    context,
                    reply(prompts::ask_name()),
                ),
                "2" => Turn::continue_at(
                    Stage::CollectingNameSupport,
                    context,
                    reply(prompts::ask_name()),
                ),
                "3" => Turn::transfer(Handoff::new(prompts::REASON_DIRECT_REQUEST), context),
                "4" => Turn::continue_at(
                    Stage::AfterHoursInfo,
                    context,
                    reply(prompts::after_hours_info()),
                ),
                _ => Turn::continue_at(
                    Stage::AwaitingOption,
                    context,
                    vec![
                        MessageIntent::text(phone, prompts::invalid_option()),
                        MessageIntent::text(phone, prompts::main_menu()),
                    ],
                ),
            },

            Stage::CollectingNameProducts => {
                remember(&mut context, context_keys::NAME, input);
                Turn::continue_at(
                    Stage::CollectingProductInterest,
                    context,
                    reply(prompts::ask_product_interest(input)),
                )
            }

            Stage::CollectingNameSupport => {
                remember(&mut context, context_keys::NAME, input);
                Turn::continue_at(
                    Stage::CollectingSupportIssue,
                    context,
                    reply(prompts::ask_support_issue(input)),
                )
            }

            Stage::CollectingProductInterest => {
                remember(&mut context, context_keys::INTEREST, input);
                Turn::transfer(
                    Handoff::new(prompts::REASON_PRODUCT_INTEREST)
                        .to_department(prompts::DEPARTMENT_SALES),
                    context,
                )
            }

            Stage::CollectingSupportIssue => {
                remember(&mut context, context_keys::ISSUE, input);
                Turn::transfer(
                    Handoff::new(prompts::REASON_SUPPORT_REQUEST)
                        .to_department(prompts::DEPARTMENT_SUPPORT),
                    context,
                )
            }

            Stage::AfterHoursInfo => match input {
                "1" => Turn::continue_at(
                    Stage::AwaitingOption,
                    context,
                    reply(prompts::main_menu()),
                ),
                "2" => Turn::transfer(Handoff::new(prompts::REASON_AFTER_HOURS), context),
                _ => Turn::continue_at(
                    Stage::AfterHoursInfo,
                    context,
                    reply(prompts::invalid_option()),
                ),
            },

            Stage::Unknown => Turn::transfer(Handoff::new(prompts::REASON_FLOW_ERROR), context),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PHONE: &str = "5511999990000";

    fn engine() -> ConversationEngine {
        ConversationEngine::new()
    }

    fn ctx(pairs: &[(&str, &str)]) -> Context {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    fn texts(turn: &Turn) -> Vec<&str> {
        turn.intents
            .iter()
            .filter_map(MessageIntent::message_text)
            .collect()
    }

    #[test]
    fn start_emits_welcome_menu() {
        let turn = engine().advance(Stage::Start, &Context::new(), PHONE, "oi");
        assert_eq!(turn.next_stage(), Some(Stage::AwaitingOption));
        assert_eq!(turn.intents.len(), 1);
        assert_eq!(turn.intents[0].target_phone, PHONE);
        let body = texts(&turn)[0];
        for option in ["1 -", "2 -", "3 -", "4 -"] {
            assert!(body.contains(option));
        }
        assert!(turn.context.is_empty());
    }

    #[test]
    fn awaiting_option_routes_each_digit() {
        let cases = [
            ("1", Some(Stage::CollectingNameProducts)),
            ("2", Some(Stage::CollectingNameSupport)),
            ("3", None),
            ("4", Some(Stage::AfterHoursInfo)),
        ];
        for (input, expected) in cases {
            let turn = engine().advance(Stage::AwaitingOption, &Context::new(), PHONE, input);
            assert_eq!(turn.next_stage(), expected, "input {input}");
        }
    }

    #[test]
    fn option_digits_tolerate_surrounding_whitespace() {
        let turn = engine().advance(Stage::AwaitingOption, &Context::new(), PHONE, " 2\n");
        assert_eq!(turn.next_stage(), Some(Stage::CollectingNameSupport));
    }

    #[test]
    fn direct_request_transfers_without_intents() {
        let turn = engine().advance(Stage::AwaitingOption, &Context::new(), PHONE, "3");
        assert!(turn.transfer_to_human());
        assert!(turn.intents.is_empty());
        let handoff = turn.handoff().unwrap();
        assert_eq!(handoff.reason, prompts::REASON_DIRECT_REQUEST);
        assert_eq!(handoff.department, None);
        assert_eq!(
            turn.context[context_keys::TRANSFER_REASON],
            json!(prompts::REASON_DIRECT_REQUEST)
        );
    }

    #[test]
    fn invalid_option_reshows_menu() {
        for input in ["5", "oi", "", "12"] {
            let turn = engine().advance(Stage::AwaitingOption, &Context::new(), PHONE, input);
            assert_eq!(turn.next_stage(), Some(Stage::AwaitingOption));
            let bodies = texts(&turn);
            assert_eq!(bodies.len(), 2);
            assert_eq!(bodies[0], prompts::invalid_option());
            assert_eq!(bodies[1], prompts::main_menu());
        }
    }

    #[test]
    fn products_branch_collects_name_then_interest() {
        let turn = engine().advance(Stage::CollectingNameProducts, &Context::new(), PHONE, "  Ana ");
        assert_eq!(turn.next_stage(), Some(Stage::CollectingProductInterest));
        assert_eq!(turn.context[context_keys::NAME], json!("Ana"));
        assert!(texts(&turn)[0].contains("Ana"));

        let turn = engine().advance(
            Stage::CollectingProductInterest,
            &turn.context,
            PHONE,
            "Plano empresarial",
        );
        assert!(turn.transfer_to_human());
        let handoff = turn.handoff().unwrap();
        assert_eq!(handoff.department.as_deref(), Some(prompts::DEPARTMENT_SALES));
        assert_eq!(turn.context[context_keys::NAME], json!("Ana"));
        assert_eq!(turn.context[context_keys::INTEREST], json!("Plano empresarial"));
        assert_eq!(turn.context[context_keys::DEPARTMENT], json!("Vendas"));
    }

    #[test]
    fn support_branch_collects_name_then_issue() {
        let turn = engine().advance(Stage::CollectingNameSupport, &Context::new(), PHONE, "João");
        assert_eq!(turn.next_stage(), Some(Stage::CollectingSupportIssue));
        assert_eq!(turn.context[context_keys::NAME], json!("João"));

        let turn = engine().advance(
            Stage::CollectingSupportIssue,
            &turn.context,
            PHONE,
            "Não consigo acessar",
        );
        assert!(turn.transfer_to_human());
        assert_eq!(turn.handoff().unwrap().department.as_deref(), Some("Suporte"));
        assert_eq!(turn.context[context_keys::ISSUE], json!("Não consigo acessar"));
        assert_eq!(turn.context[context_keys::NAME], json!("João"));
    }

    #[test]
    fn after_hours_submenu() {
        let back = engine().advance(Stage::AfterHoursInfo, &Context::new(), PHONE, "1");
        assert_eq!(back.next_stage(), Some(Stage::AwaitingOption));
        assert_eq!(texts(&back), vec![prompts::main_menu()]);

        let transfer = engine().advance(Stage::AfterHoursInfo, &Context::new(), PHONE, "2");
        assert_eq!(
            transfer.handoff().unwrap().reason,
            prompts::REASON_AFTER_HOURS
        );

        let invalid = engine().advance(Stage::AfterHoursInfo, &Context::new(), PHONE, "9");
        assert_eq!(invalid.next_stage(), Some(Stage::AfterHoursInfo));
        assert_eq!(texts(&invalid), vec![prompts::invalid_option()]);
    }

    #[test]
    fn unknown_stage_fails_toward_human() {
        let turn = engine().advance(Stage::Unknown, &ctx(&[("name", "Ana")]), PHONE, "oi");
        assert!(turn.transfer_to_human());
        assert_eq!(turn.handoff().unwrap().reason, prompts::REASON_FLOW_ERROR);
        assert_eq!(turn.context[context_keys::NAME], json!("Ana"));
    }

    #[test]
    fn context_never_loses_keys() {
        let before = ctx(&[("name", "Ana"), ("campaign", "black-friday")]);
        for stage in Stage::KNOWN {
            let turn = engine().advance(stage, &before, PHONE, "2");
            for key in before.keys() {
                assert!(turn.context.contains_key(key), "{stage} dropped {key}");
            }
        }
    }

    #[test]
    fn every_intent_targets_the_contact() {
        for stage in Stage::KNOWN {
            let turn = engine().advance(stage, &Context::new(), PHONE, "x");
            assert!(turn.intents.iter().all(|i| i.target_phone == PHONE));
        }
    }
}
