//! Outbound copy for the automation flow.
//!
//! All texts are Portuguese, matching the console the agents work in.

use serde_json::Value;

use super::engine::{Context, Handoff, context_keys};

pub const DEPARTMENT_SALES: &str = "Vendas";
pub const DEPARTMENT_SUPPORT: &str = "Suporte";

pub const REASON_DIRECT_REQUEST: &str = "Solicitação direta do cliente";
pub const REASON_AFTER_HOURS: &str = "Solicitação após horário de atendimento";
pub const REASON_PRODUCT_INTEREST: &str = "Interesse em produtos";
pub const REASON_SUPPORT_REQUEST: &str = "Solicitação de suporte";
pub const REASON_FLOW_ERROR: &str = "Erro no fluxo";
pub const REASON_AUTOMATION_FAILURE: &str = "Falha repetida na automação";
/// The contact was handed off while this message waited in the queue.
pub const REASON_ALREADY_TRANSFERRED: &str = "Conversa já transferida para atendimento humano";

/// The four-option main menu.
pub fn main_menu() -> String {
    "Escolha uma das opções abaixo:\n\n\
     1 - Conhecer nossos produtos\n\
     2 - Suporte técnico\n\
     3 - Falar com um atendente\n\
     4 - Horário de atendimento"
        .to_string()
}

/// Greeting sent on the first turn, followed by the main menu.
pub fn welcome() -> String {
    format!("Olá! Seja bem-vindo ao nosso atendimento.\n\n{}", main_menu())
}

pub fn ask_name() -> String {
    "Ótimo! Para começar, qual é o seu nome?".to_string()
}

pub fn ask_product_interest(name: &str) -> String {
    format!("Prazer, {name}! Em qual produto ou serviço você tem interesse?")
}

pub fn ask_support_issue(name: &str) -> String {
    format!("Prazer, {name}! Descreva brevemente o problema que você está enfrentando.")
}

/// Opening hours plus the after-hours sub-menu.
pub fn after_hours_info() -> String {
    "Nosso horário de atendimento é de segunda a sexta, das 8h às 18h, \
     e aos sábados, das 8h às 12h.\n\n\
     1 - Voltar ao menu principal\n\
     2 - Deixar mensagem para um atendente"
        .to_string()
}

pub fn invalid_option() -> String {
    "Opção inválida. Por favor, responda apenas com o número de uma das opções.".to_string()
}

/// Text placed in `data.text.message` of the synthesized transfer event.
///
/// A human-readable banner followed by every collected fact, so the agent
/// picking up the conversation sees the whole history in one message.
pub fn transfer_banner(handoff: &Handoff, context: &Context, original_text: &str) -> String {
    let mut banner = String::from("[TRANSFERÊNCIA DO CHATBOT]\n");
    banner.push_str(&format!("Motivo: {}\n", handoff.reason));
    if let Some(ref department) = handoff.department {
        banner.push_str(&format!("Departamento: {department}\n"));
    }
    for (label, key) in [
        ("Nome", context_keys::NAME),
        ("Interesse", context_keys::INTEREST),
        ("Problema", context_keys::ISSUE),
    ] {
        if let Some(Value::String(value)) = context.get(key) {
            banner.push_str(&format!("{label}: {value}\n"));
        }
    }
    if !original_text.trim().is_empty() {
        banner.push_str(&format!("Última mensagem: {}\n", original_text.trim()));
    }
    let serialized =
        serde_json::to_string_pretty(context).unwrap_or_else(|_| "{}".to_string());
    banner.push_str(&format!("\nContexto:\n{serialized}"));
    banner
}
