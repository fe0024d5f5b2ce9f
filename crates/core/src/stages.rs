//! The fixed audit pipeline.
//!
//! Every audit, standard or comprehensive, walks the same ordered stages.
//! The table is static and shared read-only by all jobs.

use serde::Serialize;

/// Which area of a site a stage analyses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageCategory {
    Content,
    Technical,
    Local,
    Ux,
}

/// Static description of one pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageDescriptor {
    /// Stable identifier, used in logs and views.
    pub id: &'static str,
    /// Display name.
    pub name: &'static str,
    /// Number of ranking factors the stage evaluates.
    pub factors: u32,
    pub category: StageCategory,
}

/// Stages in execution order.
pub const AUDIT_PIPELINE: [StageDescriptor; 4] = [
    StageDescriptor {
        id: "content",
        name: "Content Quality",
        factors: 28,
        category: StageCategory::Content,
    },
    StageDescriptor {
        id: "technical",
        name: "Technical SEO",
        factors: 36,
        category: StageCategory::Technical,
    },
    StageDescriptor {
        id: "local",
        name: "Local SEO",
        factors: 18,
        category: StageCategory::Local,
    },
    StageDescriptor {
        id: "ux",
        name: "User Experience",
        factors: 22,
        category: StageCategory::Ux,
    },
];

/// The shared audit pipeline.
pub fn audit_pipeline() -> &'static [StageDescriptor] {
    &AUDIT_PIPELINE
}

/// Position of a stage by identifier.
pub fn stage_index(pipeline: &[StageDescriptor], id: &str) -> Option<usize> {
    pipeline.iter().position(|stage| stage.id == id)
}

/// Sum of declared factors across a pipeline.
pub fn total_factors(pipeline: &[StageDescriptor]) -> u32 {
    pipeline.iter().map(|stage| stage.factors).sum()
}
