// [[ASSEMBLY]]/libs/assembly-core/src/catalog.rs
// Purpose: Fixed agent table, stage order and reservoir stage markers.
// Architecture: Domain Model Layer
// Dependencies: serde, serde_json, thiserror

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Invalid agent type: {0}")]
    UnknownAgent(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Flowchart,
    Network,
    Metadata,
    Synthesis,
    Pipeline,
}

/// The order the coordinator walks the stages in. Later stages read what
/// earlier ones wrote to the reservoir row, so this never changes at runtime.
pub const PIPELINE_ORDER: [AgentType; 5] = [
    AgentType::Flowchart,
    AgentType::Network,
    AgentType::Metadata,
    AgentType::Synthesis,
    AgentType::Pipeline,
];

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Flowchart => "flowchart",
            AgentType::Network => "network",
            AgentType::Metadata => "metadata",
            AgentType::Synthesis => "synthesis",
            AgentType::Pipeline => "pipeline",
        }
    }

    /// Name the agent reports about itself and uses in token snapshots.
    pub fn agent_name(&self) -> &'static str {
        match self {
            AgentType::Flowchart => "flowchart_mapper",
            AgentType::Network => "network_mapper",
            AgentType::Metadata => "metadata_hunter",
            AgentType::Synthesis => "content_synthesizer",
            AgentType::Pipeline => "data_pipeline",
        }
    }

    /// Stage-specific coordination envelope sent with `/process`.
    pub fn coordination_params(&self) -> Value {
        match self {
            AgentType::Flowchart => json!({
                "expected_output": "intellectual_architecture_analysis",
                "quality_threshold": "A-grade synthesis",
                "methodological_depth": "real_book_research"
            }),
            AgentType::Network => json!({
                "expected_output": "conceptual_network_analysis",
                "dependency_data": "flowchart_intellectual_architecture",
                "analysis_depth": "argumentative_DNA_discovery"
            }),
            AgentType::Metadata => json!({
                "expected_output": "comprehensive_bibliographic_metadata",
                "research_depth": "arabic_titles_author_details_publication_data",
                "quality_standard": "15_metadata_fields_minimum"
            }),
            AgentType::Synthesis => json!({
                "expected_output": "library_catalog_fields",
                "input_sources": ["flowchart_analysis", "network_analysis"],
                "synthesis_approach": "extract_and_transform"
            }),
            AgentType::Pipeline => json!({
                "expected_output": "production_database_updates",
                "transformation_source": "complete_reservoir_enrichment",
                "quality_validation": "production_readiness_check"
            }),
        }
    }

    /// Enhancement counter fed by this stage's processed count.
    pub fn enhancement_category(&self) -> &'static str {
        match self {
            AgentType::Flowchart => "intellectual_architecture_analyzed",
            AgentType::Network => "conceptual_networks_discovered",
            AgentType::Metadata => "bibliographic_research_completed",
            AgentType::Synthesis => "catalog_fields_synthesized",
            AgentType::Pipeline => "production_records_created",
        }
    }

    /// Advisory follow-up label attached to a failed stage.
    pub fn recovery_label(&self) -> &'static str {
        match self {
            AgentType::Flowchart => "rerun_structure_analysis_next_run",
            AgentType::Network => "rerun_network_discovery_next_run",
            AgentType::Metadata => "rerun_metadata_research_next_run",
            AgentType::Synthesis => "rerun_catalog_synthesis_next_run",
            AgentType::Pipeline => "retry_database_population_next_run",
        }
    }

    /// Reservoir column holding this stage's analysis.
    pub fn output_column(&self) -> &'static str {
        match self {
            AgentType::Flowchart => "flowchart_analysis",
            AgentType::Network => "network_analysis",
            AgentType::Metadata => "metadata_findings",
            AgentType::Synthesis => "content_synthesis",
            AgentType::Pipeline => "pipeline_summary",
        }
    }

    /// Stage marker a book carries while waiting for this agent.
    pub fn stage(&self) -> ProcessingStage {
        match self {
            AgentType::Flowchart => ProcessingStage::Flowchart,
            AgentType::Network => ProcessingStage::Network,
            AgentType::Metadata => ProcessingStage::Metadata,
            AgentType::Synthesis => ProcessingStage::Synthesis,
            AgentType::Pipeline => ProcessingStage::Pipeline,
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flowchart" => Ok(AgentType::Flowchart),
            "network" => Ok(AgentType::Network),
            "metadata" => Ok(AgentType::Metadata),
            "synthesis" => Ok(AgentType::Synthesis),
            "pipeline" => Ok(AgentType::Pipeline),
            _ => Err(CatalogError::UnknownAgent(s.to_string())),
        }
    }
}

/// Static per-stage configuration. Built once at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentDescriptor {
    pub agent_type: AgentType,
    pub name: String,
    pub port: u16,
    pub expected_output: String,
    pub methodology: String,
    pub expertise: String,
}

impl AgentDescriptor {
    pub fn default_for(agent_type: AgentType) -> Self {
        let (name, port, expected_output, methodology, expertise) = match agent_type {
            AgentType::Flowchart => (
                "Enhanced Flowchart Mapper - Intellectual Architecture Specialist",
                3001,
                "intellectual_architecture_analysis",
                "Argument as Structure + Inferential Specificity",
                "Islamic Intellectual Architecture Analysis",
            ),
            AgentType::Network => (
                "Enhanced Network Mapper - Conceptual Network Analyst",
                3002,
                "conceptual_network_analysis",
                "Knowledge Discovery + Argumentative DNA Analysis",
                "Islamic Conceptual Network Discovery",
            ),
            AgentType::Metadata => (
                "Enhanced Metadata Hunter - Bibliographic Research Specialist",
                3003,
                "comprehensive_bibliographic_metadata",
                "Multi-Source Arabic Title + Author + Publication Research",
                "Islamic Bibliographic Research",
            ),
            AgentType::Synthesis => (
                "Enhanced Content Synthesizer - Library Catalog Synthesis Specialist",
                3004,
                "library_catalog_fields",
                "Spartan Research-to-Catalog Transformation",
                "Library Catalog Field Synthesis",
            ),
            AgentType::Pipeline => (
                "Enhanced Data Pipeline - Production Database Population Specialist",
                3006,
                "production_database_updates",
                "Enriched Research to Production Catalog Pipeline",
                "Production Database Population",
            ),
        };

        AgentDescriptor {
            agent_type,
            name: name.to_string(),
            port,
            expected_output: expected_output.to_string(),
            methodology: methodology.to_string(),
            expertise: expertise.to_string(),
        }
    }

    /// The full five-stage table in pipeline order.
    pub fn defaults() -> Vec<AgentDescriptor> {
        PIPELINE_ORDER.iter().map(|t| Self::default_for(*t)).collect()
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Progress marker on a reservoir row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStage {
    Pending,
    Flowchart,
    Network,
    Metadata,
    Synthesis,
    Pipeline,
    Completed,
}

impl ProcessingStage {
    /// Next marker in the fixed progression; `Completed` is terminal.
    pub fn next(&self) -> ProcessingStage {
        match self {
            ProcessingStage::Pending => ProcessingStage::Flowchart,
            ProcessingStage::Flowchart => ProcessingStage::Network,
            ProcessingStage::Network => ProcessingStage::Metadata,
            ProcessingStage::Metadata => ProcessingStage::Synthesis,
            ProcessingStage::Synthesis => ProcessingStage::Pipeline,
            ProcessingStage::Pipeline => ProcessingStage::Completed,
            ProcessingStage::Completed => ProcessingStage::Completed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStage::Pending => "pending",
            ProcessingStage::Flowchart => "flowchart",
            ProcessingStage::Network => "network",
            ProcessingStage::Metadata => "metadata",
            ProcessingStage::Synthesis => "synthesis",
            ProcessingStage::Pipeline => "pipeline",
            ProcessingStage::Completed => "completed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_pipeline_order() {
        let table = AgentDescriptor::defaults();
        let order: Vec<AgentType> = table.iter().map(|d| d.agent_type).collect();
        assert_eq!(order, PIPELINE_ORDER.to_vec());
        assert_eq!(table[4].port, 3006);
    }

    #[test]
    fn test_agent_type_parsing() {
        assert_eq!("Network".parse::<AgentType>().unwrap(), AgentType::Network);
        assert_eq!(
            "librarian".parse::<AgentType>(),
            Err(CatalogError::UnknownAgent("librarian".to_string()))
        );
    }

    #[test]
    fn test_stage_progression_is_monotonic() {
        let mut stage = ProcessingStage::Pending;
        let mut seen = vec![stage];
        while stage != ProcessingStage::Completed {
            let next = stage.next();
            assert!(next > stage);
            stage = next;
            seen.push(stage);
        }
        assert_eq!(seen.len(), 7);
        assert_eq!(ProcessingStage::Completed.next(), ProcessingStage::Completed);
    }

    #[test]
    fn test_each_agent_advances_its_own_stage() {
        for agent in PIPELINE_ORDER {
            assert_eq!(agent.stage().as_str(), agent.as_str());
        }
        assert_eq!(AgentType::Pipeline.stage().next(), ProcessingStage::Completed);
    }
}
