use crate::models::{ImageAnalysis, SimilarItem};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum SalesTier {
    A,
    #[default]
    B,
    C,
    D,
}

/// A reference product in the gallery catalog.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogItem {
    pub id: String,
    pub filename: String,
    #[serde(default)]
    pub upload_time: String,
    #[serde(default)]
    pub analysis: ImageAnalysis,
    // Unrated items count as tier B
    #[serde(default)]
    pub sales_tier: SalesTier,
}

impl CatalogItem {
    pub fn image_url(&self) -> String {
        format!("/gallery/{}", self.filename)
    }

    fn tags_lowercase(&self) -> HashSet<String> {
        self.analysis.style.tags.iter().map(|t| t.to_lowercase()).collect()
    }
}

#[derive(Serialize, Deserialize)]
struct CatalogFile {
    items: Vec<CatalogItem>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogStats {
    pub total: usize,
    pub by_tier: BTreeMap<SalesTier, usize>,
    /// The ten most frequent style tags.
    pub top_tags: Vec<(String, usize)>,
}

#[derive(Clone, Debug, Default)]
pub struct Catalog {
    items: Vec<CatalogItem>,
}

impl Catalog {
    pub fn new(items: Vec<CatalogItem>) -> Self {
        Self { items }
    }

    /// Parses the `{ "items": [...] }` gallery metadata document.
    pub fn from_json(data: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(data).context("Failed to parse gallery metadata")?;
        log::info!("Loaded {} gallery items", file.items.len());
        Ok(Self::new(file.items))
    }

    pub fn items(&self) -> &[CatalogItem] {
        &self.items
    }

    pub fn get(&self, id: &str) -> Option<&CatalogItem> {
        self.items.iter().find(|item| item.id == id)
    }

    /// Items ranked by Jaccard similarity of style tags, zero scores dropped.
    pub fn find_similar(&self, analysis: &ImageAnalysis, top_k: usize) -> Vec<SimilarItem> {
        let input: HashSet<String> = analysis.style.tags.iter().map(|t| t.to_lowercase()).collect();

        let mut scored: Vec<SimilarItem> = self
            .items
            .iter()
            .map(|item| {
                let tags = item.tags_lowercase();
                let intersection = input.intersection(&tags).count();
                let union = input.union(&tags).count();
                let similarity = if union > 0 {
                    intersection as f64 / union as f64
                } else {
                    0.0
                };
                SimilarItem {
                    id: item.id.clone(),
                    image_url: item.image_url(),
                    similarity: (similarity * 100.0).round() / 100.0,
                }
            })
            .filter(|s| s.similarity > 0.0)
            .collect();

        scored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        scored.truncate(top_k);
        scored
    }

    /// Items having any tag that contains one of `tags`. No tags matches everything.
    pub fn search_by_style_tags(&self, tags: &[&str]) -> Vec<&CatalogItem> {
        if tags.is_empty() {
            return self.items.iter().collect();
        }
        let wanted: Vec<String> = tags.iter().map(|t| t.to_lowercase()).collect();
        self.items
            .iter()
            .filter(|item| {
                item.analysis
                    .style
                    .tags
                    .iter()
                    .map(|t| t.to_lowercase())
                    .any(|t| wanted.iter().any(|w| t.contains(w.as_str())))
            })
            .collect()
    }

    pub fn search_by_element_type(&self, element_type: &str) -> Vec<&CatalogItem> {
        let needle = element_type.to_lowercase();
        self.items
            .iter()
            .filter(|item| {
                let groups = &item.analysis.elements;
                groups
                    .primary
                    .iter()
                    .chain(&groups.secondary)
                    .chain(&groups.hardware)
                    .any(|el| el.kind.to_lowercase().contains(&needle))
            })
            .collect()
    }

    pub fn filter_by_sales_tier(&self, tier: SalesTier) -> Vec<&CatalogItem> {
        self.items.iter().filter(|item| item.sales_tier == tier).collect()
    }

    pub fn all_style_tags(&self) -> Vec<String> {
        let tags: BTreeSet<&String> = self.items.iter().flat_map(|i| &i.analysis.style.tags).collect();
        tags.into_iter().cloned().collect()
    }

    pub fn stats(&self) -> CatalogStats {
        let mut by_tier = BTreeMap::new();
        let mut tag_counts: BTreeMap<&str, usize> = BTreeMap::new();
        for item in &self.items {
            *by_tier.entry(item.sales_tier).or_insert(0) += 1;
            for tag in &item.analysis.style.tags {
                *tag_counts.entry(tag.as_str()).or_insert(0) += 1;
            }
        }

        let mut top_tags: Vec<(String, usize)> =
            tag_counts.into_iter().map(|(t, c)| (t.to_string(), c)).collect();
        top_tags.sort_by(|a, b| b.1.cmp(&a.1));
        top_tags.truncate(10);

        CatalogStats {
            total: self.items.len(),
            by_tier,
            top_tags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const METADATA: &str = r#"{"items":[
        {"id":"g1","filename":"shell.jpg","uploadTime":"2024-01-01","salesTier":"A",
         "analysis":{"elements":{"primary":[{"type":"贝壳"}],"secondary":[],"hardware":[{"type":"龙虾扣"}]},
                     "style":{"tags":["海洋风","少女感"],"mood":"清新"}}},
        {"id":"g2","filename":"star.jpg",
         "analysis":{"style":{"tags":["海洋风","梦幻"],"mood":"梦幻"}}},
        {"id":"g3","filename":"boho.jpg","salesTier":"C",
         "analysis":{"style":{"tags":["波西米亚"],"mood":"自然"}}}
    ]}"#;

    fn catalog() -> Catalog {
        Catalog::from_json(METADATA).unwrap()
    }

    fn analysis_with_tags(tags: &[&str]) -> ImageAnalysis {
        let mut analysis = ImageAnalysis::default();
        analysis.style.tags = tags.iter().map(|t| t.to_string()).collect();
        analysis
    }

    #[test]
    fn missing_sales_tier_defaults_to_b() {
        assert_eq!(catalog().get("g2").unwrap().sales_tier, SalesTier::B);
    }

    #[test]
    fn find_similar_ranks_by_jaccard_and_drops_zero() {
        let similar = catalog().find_similar(&analysis_with_tags(&["海洋风", "少女感"]), 5);
        let ids: Vec<&str> = similar.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["g1", "g2"]);
        assert_eq!(similar[0].similarity, 1.0);
        assert_eq!(similar[1].similarity, 0.33);
        assert_eq!(similar[0].image_url, "/gallery/shell.jpg");
    }

    #[test]
    fn find_similar_respects_top_k() {
        let similar = catalog().find_similar(&analysis_with_tags(&["海洋风"]), 1);
        assert_eq!(similar.len(), 1);
    }

    #[test]
    fn searches_match_substrings() {
        let catalog = catalog();
        assert_eq!(catalog.search_by_style_tags(&["海洋"]).len(), 2);
        assert_eq!(catalog.search_by_style_tags(&[]).len(), 3);
        assert_eq!(catalog.search_by_element_type("扣").len(), 1);
        assert_eq!(catalog.filter_by_sales_tier(SalesTier::C).len(), 1);
    }

    #[test]
    fn stats_and_tags() {
        let catalog = catalog();
        let stats = catalog.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_tier[&SalesTier::B], 1);
        assert_eq!(stats.top_tags[0], ("海洋风".to_string(), 2));
        assert_eq!(catalog.all_style_tags().len(), 4);
    }
}
