use serde::Serialize;

/// A selectable chat model. `id` is what callers send; `api_identifier` is
/// what goes on the wire (they can differ when an id aliases a deployment).
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ModelSpec {
    pub id: &'static str,
    pub label: &'static str,
    pub api_identifier: &'static str,
    pub description: &'static str,
}

pub const DEFAULT_MODEL_ID: &str = "llama3.1-70b";

pub fn default_models() -> Vec<ModelSpec> {
    vec![
        ModelSpec {
            id: "llama3.1-8b",
            label: "Llama 3.1 8b",
            api_identifier: "llama3.1-8b",
            description: "Small model for lightning fast responses.",
        },
        ModelSpec {
            id: "llama3.1-70b",
            label: "Llama 3.1 70b",
            api_identifier: "llama3.1-70b",
            description: "Larger model for more complex tasks.",
        },
    ]
}

pub fn find_model<'a>(models: &'a [ModelSpec], id: &str) -> Option<&'a ModelSpec> {
    models.iter().find(|model| model.id == id)
}
