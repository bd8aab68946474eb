//! Resolves item hrefs against a directory of item JSON files.

use std::fs;
use std::path::PathBuf;

use qti_eval::types::AssessmentItemRef;
use qti_eval::{ItemLookup, ItemResolver};

pub(crate) struct DirectoryResolver {
    base: PathBuf,
}

impl DirectoryResolver {
    pub(crate) fn new(base: PathBuf) -> Self {
        DirectoryResolver { base }
    }
}

impl ItemResolver for DirectoryResolver {
    fn resolve(&self, item_ref: &AssessmentItemRef) -> ItemLookup {
        let path = self.base.join(&item_ref.href);
        let failed = |reason: String| ItemLookup::Failed {
            href: item_ref.href.clone(),
            reason,
        };
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) => return failed(format!("cannot read {}: {}", path.display(), e)),
        };
        match serde_json::from_str(&text) {
            Ok(item) => ItemLookup::Resolved(item),
            Err(e) => failed(format!("invalid item JSON in {}: {}", path.display(), e)),
        }
    }
}
