//! Prompt templates for every LLM step of a run

use super::model::{ChatRole, ChatTurn, PartialAnswer, SubQuestion};
use crate::retrieval::RetrievedChunk;

/// Turns of history included in prompts
const HISTORY_TURNS: usize = 6;

/// Characters of each exploratory chunk shown to the decomposer
const EXPLORATORY_SNIPPET_CHARS: usize = 300;

pub const CLASSIFIER_SYSTEM: &str = "You decide whether answering the latest user message requires \
searching the document index. Searching is expensive; skip it only when the conversation \
already contains everything needed, for example a request to rephrase, summarize or \
translate the previous answer, or small talk. Reply with exactly SEARCH or SKIP SEARCH.";

pub const DECOMPOSITION_SYSTEM: &str = "You split a complex question into a few narrower \
sub-questions that can each be answered from a document index. Each sub-question must be \
answerable on its own. Reply with a JSON array of objects \
{\"question\": string, \"entities\": [string]} and nothing else.";

pub const SUB_ANSWER_SYSTEM: &str = "You answer a question using ONLY the provided documents. \
If the documents do not contain the answer, say so. Do not make up information. \
Cite the documents you use inline as [1], [2], etc.";

pub const CONVERSATION_SYSTEM: &str = "You are a helpful assistant continuing a conversation. \
Answer from the conversation so far; do not invent facts or sources.";

pub const SYNTHESIS_SYSTEM: &str = "You combine answers to sub-questions into one coherent \
answer to the original question. Keep the numbered citations [n] exactly as they appear in \
the sub-answers next to the claims they support; never invent new numbers.";

fn push_history(prompt: &mut String, history: &[ChatTurn]) {
    if history.is_empty() {
        return;
    }
    prompt.push_str("Conversation so far:\n");
    let skip = history.len().saturating_sub(HISTORY_TURNS);
    for turn in &history[skip..] {
        let speaker = match turn.role {
            ChatRole::User => "User",
            ChatRole::Assistant => "Assistant",
        };
        prompt.push_str(&format!("{}: {}\n", speaker, turn.content));
    }
    prompt.push('\n');
}

fn push_persona(prompt: &mut String, persona: Option<&str>) {
    if let Some(persona) = persona.filter(|p| !p.trim().is_empty()) {
        prompt.push_str(&format!("Instructions: {}\n\n", persona.trim()));
    }
}

pub fn classifier_prompt(query: &str, history: &[ChatTurn]) -> String {
    let mut prompt = String::new();
    push_history(&mut prompt, history);
    prompt.push_str(&format!("Latest message: {}\n\nDecision:", query));
    prompt
}

pub fn decomposition_prompt(query: &str, exploratory: &[RetrievedChunk], max_sub_questions: usize) -> String {
    let mut prompt = format!(
        "Produce at most {} sub-questions for the question below.\n\nQuestion: {}\n",
        max_sub_questions, query
    );

    if !exploratory.is_empty() {
        prompt.push_str("\nThe index contains, among others:\n");
        for chunk in exploratory {
            let snippet: String = chunk.text.chars().take(EXPLORATORY_SNIPPET_CHARS).collect();
            prompt.push_str(&format!("- {}: {}\n", chunk.title(), snippet));
        }
    }

    prompt.push_str("\nSub-questions:");
    prompt
}

/// `parent` is the original query when `question` is one part of it
pub fn sub_answer_prompt(
    question: &str,
    parent: Option<&str>,
    chunks: &[RetrievedChunk],
    persona: Option<&str>,
) -> String {
    let mut prompt = String::new();
    push_persona(&mut prompt, persona);
    if let Some(parent) = parent.filter(|p| *p != question) {
        prompt.push_str(&format!("This question is part of answering: {}\n", parent));
    }
    prompt.push_str(&format!("Question: {}\n\nDocuments:\n", question));

    for (i, chunk) in chunks.iter().enumerate() {
        prompt.push_str(&format!(
            "\n[{}] {} (relevance: {:.2})\n{}\n",
            i + 1,
            chunk.title(),
            chunk.relevance_score,
            chunk.text
        ));
    }

    prompt.push_str("\nAnswer:");
    prompt
}

pub fn conversation_prompt(query: &str, history: &[ChatTurn], persona: Option<&str>) -> String {
    let mut prompt = String::new();
    push_persona(&mut prompt, persona);
    push_history(&mut prompt, history);
    prompt.push_str(&format!("User: {}\n\nAssistant:", query));
    prompt
}

/// Merge prompt; `answers` pairs each sub-question with its globally numbered answer text
pub fn synthesis_prompt(query: &str, answers: &[(&SubQuestion, String)], persona: Option<&str>) -> String {
    let mut prompt = String::new();
    push_persona(&mut prompt, persona);
    prompt.push_str(&format!("Original question: {}\n\n", query));

    for (sub_question, text) in answers {
        prompt.push_str(&format!("Sub-question: {}\nAnswer: {}\n\n", sub_question.text, text));
    }

    prompt.push_str("Combined answer:");
    prompt
}

/// Heading used when sub-answers are concatenated without a merge call
pub fn fallback_section(sub_question: Option<&SubQuestion>, partial: &PartialAnswer, text: &str) -> String {
    match sub_question {
        Some(sq) => format!("{}\n{}", sq.text, text),
        None => format!("Sub-question {}\n{}", partial.sub_question_id + 1, text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_history_truncated() {
        let history: Vec<ChatTurn> = (0..10).map(|i| ChatTurn::user(format!("turn {}", i))).collect();
        let prompt = classifier_prompt("and now?", &history);
        assert!(!prompt.contains("turn 3\n"));
        assert!(prompt.contains("turn 4\n"));
        assert!(prompt.contains("turn 9\n"));
    }

    #[test]
    fn test_sub_answer_prompt_numbers_documents() {
        let chunks = vec![
            RetrievedChunk {
                document_id: "d1".into(),
                chunk_id: "c1".into(),
                text: "Refunds within 30 days.".into(),
                relevance_score: 0.8,
                source_metadata: BTreeMap::new(),
            },
            RetrievedChunk {
                document_id: "d2".into(),
                chunk_id: "c2".into(),
                text: "Cancellations are free.".into(),
                relevance_score: 0.6,
                source_metadata: BTreeMap::new(),
            },
        ];
        let prompt = sub_answer_prompt("Refund policy?", None, &chunks, Some("Be brief."));
        assert!(prompt.starts_with("Instructions: Be brief."));
        assert!(prompt.contains("[1] d1 (relevance: 0.80)"));
        assert!(prompt.contains("[2] d2 (relevance: 0.60)"));
    }
}
