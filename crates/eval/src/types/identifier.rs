//! Identifier tokens and variable references.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Immutable QTI identifier. Cloning is a reference-count bump.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(Arc<str>);

impl Identifier {
    /// Builds an identifier without lexical validation.
    ///
    /// Use this for names coming from an already-validated definition.
    /// Candidate input goes through [`Identifier::parse`].
    pub fn new(name: &str) -> Self {
        Identifier(Arc::from(name))
    }

    /// Parses an identifier, checking the QTI lexical form.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let mut chars = text.chars();
        let first = chars.next().ok_or_else(|| ParseError::InvalidIdentifier {
            text: text.to_string(),
        })?;
        if !(first.is_alphabetic() || first == '_') {
            return Err(ParseError::InvalidIdentifier {
                text: text.to_string(),
            });
        }
        if !chars.all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
            return Err(ParseError::InvalidIdentifier {
                text: text.to_string(),
            });
        }
        Ok(Identifier::new(text))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identifier {
    fn from(name: &str) -> Self {
        Identifier::new(name)
    }
}

impl Borrow<str> for Identifier {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ──────────────────────────────────────────────
// Variable references
// ──────────────────────────────────────────────

/// Reference to a variable from inside an expression.
///
/// Items only ever use the local form. Test-level expressions may also use
/// `itemRef.variable` or `itemRef.N.variable`, where `N` is the 1-based
/// instance number of an item that was selected more than once.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VariableRef {
    pub item_ref: Option<Identifier>,
    pub instance: Option<usize>,
    pub variable: Identifier,
}

impl VariableRef {
    pub fn local(variable: impl Into<Identifier>) -> Self {
        VariableRef {
            item_ref: None,
            instance: None,
            variable: variable.into(),
        }
    }

    pub fn dotted(item_ref: impl Into<Identifier>, variable: impl Into<Identifier>) -> Self {
        VariableRef {
            item_ref: Some(item_ref.into()),
            instance: None,
            variable: variable.into(),
        }
    }

    pub fn is_dotted(&self) -> bool {
        self.item_ref.is_some()
    }
}

impl From<Identifier> for VariableRef {
    fn from(variable: Identifier) -> Self {
        VariableRef::local(variable)
    }
}

impl fmt::Display for VariableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(item_ref) = &self.item_ref {
            write!(f, "{}.", item_ref)?;
            if let Some(instance) = self.instance {
                write!(f, "{}.", instance)?;
            }
        }
        write!(f, "{}", self.variable)
    }
}

impl FromStr for VariableRef {
    type Err = ParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = text.split('.').collect();
        match parts.as_slice() {
            [variable] => Ok(VariableRef::local(Identifier::parse(variable)?)),
            [item_ref, variable] => Ok(VariableRef::dotted(
                Identifier::parse(item_ref)?,
                Identifier::parse(variable)?,
            )),
            [item_ref, instance, variable] => {
                let instance = instance
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| ParseError::InvalidVariableRef {
                        text: text.to_string(),
                    })?;
                Ok(VariableRef {
                    item_ref: Some(Identifier::parse(item_ref)?),
                    instance: Some(instance),
                    variable: Identifier::parse(variable)?,
                })
            }
            _ => Err(ParseError::InvalidVariableRef {
                text: text.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for VariableRef {
    type Error = ParseError;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        text.parse()
    }
}

impl From<VariableRef> for String {
    fn from(reference: VariableRef) -> Self {
        reference.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_lexical_form() {
        assert!(Identifier::parse("ChoiceA").is_ok());
        assert!(Identifier::parse("_x-1").is_ok());
        assert!(Identifier::parse("").is_err());
        assert!(Identifier::parse("1abc").is_err());
        assert!(Identifier::parse("a.b").is_err());
        assert!(Identifier::parse("a b").is_err());
    }

    #[test]
    fn variable_ref_forms() {
        let local: VariableRef = "SCORE".parse().unwrap();
        assert!(!local.is_dotted());

        let dotted: VariableRef = "item1.SCORE".parse().unwrap();
        assert_eq!(dotted.item_ref, Some(Identifier::new("item1")));
        assert_eq!(dotted.instance, None);

        let instanced: VariableRef = "item1.2.SCORE".parse().unwrap();
        assert_eq!(instanced.instance, Some(2));
        assert_eq!(instanced.to_string(), "item1.2.SCORE");

        assert!("item1.0.SCORE".parse::<VariableRef>().is_err());
        assert!("a.b.c.d".parse::<VariableRef>().is_err());
    }
}
