#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
}

impl Model {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
        }
    }

    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), id)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Fixed, enumerated set of models the selector may offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelWhitelist {
    models: Vec<Model>,
}

impl ModelWhitelist {
    /// Builds a whitelist, dropping blank and duplicate ids while keeping order.
    pub fn new(models: impl IntoIterator<Item = Model>) -> Self {
        let mut unique: Vec<Model> = Vec::new();
        for mut model in models {
            model.id = model.id.trim().to_string();
            if model.id.is_empty() || unique.iter().any(|known| known.id == model.id) {
                continue;
            }
            unique.push(model);
        }
        Self { models: unique }
    }

    pub fn models(&self) -> &[Model] {
        &self.models
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.models.iter().map(|model| model.id.as_str())
    }

    /// Exact lookup; no trimming or case folding.
    pub fn find(&self, id: &str) -> Option<&Model> {
        self.models.iter().find(|model| model.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.find(id).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

impl Default for ModelWhitelist {
    fn default() -> Self {
        Self::new(default_local_models())
    }
}

pub const DEFAULT_LOCAL_MODEL: &str = "llama-3.2-1b-instruct";

pub fn default_local_models() -> Vec<Model> {
    vec![
        Model::new(DEFAULT_LOCAL_MODEL, "Llama 3.2 1B Instruct")
            .with_description("Small, fast default"),
        Model::new("qwen2.5-1.5b-instruct", "Qwen 2.5 1.5B Instruct")
            .with_description("Multilingual general model"),
        Model::new("phi-3.5-mini-instruct", "Phi 3.5 Mini Instruct")
            .with_description("Reasoning-leaning 3.8B model"),
        Model::new("gemma-2-2b-it", "Gemma 2 2B IT"),
    ]
}
