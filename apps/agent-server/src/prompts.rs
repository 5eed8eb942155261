// [[ASSEMBLY]]/apps/agent-server/src/prompts.rs
// Purpose: Per-stage prompt assembly and the fields each stage must return.

use assembly_core::{AgentType, ReservoirBook};

/// Top-level keys a stage's analysis is expected to carry. Missing keys are
/// logged, not rejected.
pub fn required_fields(agent: AgentType) -> &'static [&'static str] {
    match agent {
        AgentType::Flowchart => &["concept", "flowchart_map"],
        AgentType::Network => &["conceptual_network"],
        AgentType::Metadata => &["bibliographic_research"],
        AgentType::Synthesis => &["categories", "keywords", "description"],
        AgentType::Pipeline => &["tables_updated"],
    }
}

pub fn system_prompt(agent: AgentType) -> String {
    let focus = match agent {
        AgentType::Flowchart => {
            "intellectual architecture analysis: central thesis, genre, argumentative structure and logical progression"
        }
        AgentType::Network => {
            "conceptual network discovery: central concepts, related works and argumentative lineage"
        }
        AgentType::Metadata => {
            "bibliographic research: Arabic title, author details, publication history and editions"
        }
        AgentType::Synthesis => {
            "library catalog synthesis: categories, keywords and a concise catalog description"
        }
        AgentType::Pipeline => {
            "production catalog preparation: which tables and fields the enriched record updates"
        }
    };

    format!(
        "You are an expert in classical Islamic scholarship working on {}. \
         Respond with a single JSON object containing at least these keys: {}.",
        focus,
        required_fields(agent).join(", ")
    )
}

pub fn analysis_prompt(agent: AgentType, book: &ReservoirBook) -> String {
    let mut prompt = format!(
        "Stage: {}\n\nBook Context:\nTitle: {}\nAuthor: {}\nBook ID: {}\n",
        agent,
        book.title,
        book.author_name.as_deref().unwrap_or("Unknown"),
        book.book_id
    );

    if let Some(description) = &book.description {
        prompt.push_str(&format!("Description: {}\n", description));
    }
    if !book.agents_completed.is_empty() {
        prompt.push_str(&format!(
            "Completed stages: {}\n",
            book.agents_completed.join(", ")
        ));
    }

    prompt.push_str("\nReturn structured JSON suitable for database storage.\n");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_includes_book_context() {
        let book = ReservoirBook {
            reservoir_id: "r-9".into(),
            book_id: "b-9".into(),
            title: "Al-Muwatta".into(),
            author_name: None,
            description: Some("Early hadith compilation".into()),
            processing_stage: Some("network".into()),
            agents_completed: vec!["flowchart".into()],
        };

        let prompt = analysis_prompt(AgentType::Network, &book);
        assert!(prompt.contains("Title: Al-Muwatta"));
        assert!(prompt.contains("Author: Unknown"));
        assert!(prompt.contains("Completed stages: flowchart"));
        assert!(system_prompt(AgentType::Synthesis).contains("categories, keywords, description"));
    }
}
