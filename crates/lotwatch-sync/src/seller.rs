//! Condition, upkeep and defect cues pulled out of a seller's description.

use anyhow::Result;
use lotwatch_core::SellerInfo;
use serde::Deserialize;

use crate::normalize::Term;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SellerTerms {
    #[serde(default)]
    pub conditions: Vec<ConditionGrade>,
    #[serde(default)]
    pub maintenance: Vec<String>,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub service_records: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConditionGrade {
    pub grade: String,
    pub terms: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct SellerExtractor {
    conditions: Vec<(String, Vec<Term>)>,
    maintenance: Vec<Term>,
    issues: Vec<Term>,
    service_records: Vec<Term>,
}

fn compile_all(terms: &[String]) -> Result<Vec<Term>> {
    terms.iter().map(|t| Term::compile(t, t)).collect()
}

fn found_in(terms: &[Term], text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for term in terms.iter().filter(|t| t.regex.is_match(text)) {
        if !found.contains(&term.display) {
            found.push(term.display.clone());
        }
    }
    found
}

impl SellerExtractor {
    pub(crate) fn new(terms: &SellerTerms) -> Result<Self> {
        let conditions = terms
            .conditions
            .iter()
            .map(|c| Ok((c.grade.clone(), compile_all(&c.terms)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            conditions,
            maintenance: compile_all(&terms.maintenance)?,
            issues: compile_all(&terms.issues)?,
            service_records: compile_all(&terms.service_records)?,
        })
    }

    pub(crate) fn extract(&self, description: &str) -> SellerInfo {
        let condition = self
            .conditions
            .iter()
            .find(|(_, terms)| terms.iter().any(|t| t.regex.is_match(description)))
            .map(|(grade, _)| grade.clone());
        SellerInfo {
            condition,
            maintenance: found_in(&self.maintenance, description),
            issues: found_in(&self.issues, description),
            service_records: found_in(&self.service_records, description),
        }
    }
}
