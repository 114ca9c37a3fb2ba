use anyhow::{anyhow, Result};

use crate::labels_match;

/// Index → label table shared by the detector and the alert policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassTable {
    names: Vec<String>,
}

impl ClassTable {
    pub fn from_names<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names
            .into_iter()
            .map(|name| name.into().trim().to_string())
            .collect();
        if names.is_empty() {
            return Err(anyhow!("class table must contain at least one class"));
        }
        if let Some(blank) = names.iter().position(|name| name.is_empty()) {
            return Err(anyhow!("class {} has an empty name", blank));
        }
        for (i, name) in names.iter().enumerate() {
            if names[..i].iter().any(|other| labels_match(other, name)) {
                return Err(anyhow!("duplicate class name '{}'", name));
            }
        }
        Ok(Self { names })
    }

    pub fn label(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// Case-insensitive lookup.
    pub fn index_of(&self, class: &str) -> Option<usize> {
        self.names.iter().position(|name| labels_match(name, class))
    }

    /// Fails unless `target` is one of the classes. Monitoring without the
    /// watched class would never raise an alert.
    pub fn require_class(&self, target: &str) -> Result<usize> {
        self.index_of(target).ok_or_else(|| {
            anyhow!(
                "alert class '{}' not found in model classes [{}]",
                target,
                self.names.join(", ")
            )
        })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
