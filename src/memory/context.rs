use super::item::{MemoryItem, MemoryLevel};
use super::layered::LayeredMemory;
use crate::error::MemoryError;
use crate::llm::estimate_tokens;

// Budget shares per tier, in priority order. They sum below 1.0; the
// remainder is slack for section headers and joins.
const CONTEXT_SHARE: f64 = 0.40;
const CHARACTER_SHARE: f64 = 0.25;
const PLOT_SHARE: f64 = 0.20;
const GLOBAL_SHARE: f64 = 0.10;
const STYLE_SHARE: f64 = 0.05;

impl LayeredMemory {
    /// Compose the retrieval string for a generation prompt: latest
    /// CONTEXT, then the best CHARACTER / PLOT / GLOBAL matches for the
    /// query, then STYLE, each under its share of the token budget.
    /// Output stays within `budget_tokens` plus 2% slack.
    pub async fn build_context(
        &self,
        query: &str,
        budget_tokens: u32,
    ) -> Result<String, MemoryError> {
        self.build_context_with_k(query, budget_tokens, self.retrieval_k())
            .await
    }

    /// `build_context` with an explicit k, so callers under token pressure
    /// can tighten both the budget and the retrieval breadth.
    pub async fn build_context_with_k(
        &self,
        query: &str,
        budget_tokens: u32,
        k: usize,
    ) -> Result<String, MemoryError> {
        if budget_tokens < 50 {
            return Err(MemoryError::BudgetTooSmall(budget_tokens));
        }

        let k = k.max(1);
        let mut sections: Vec<String> = Vec::new();

        // Latest context, chronological once selected.
        let context_budget = share(budget_tokens, CONTEXT_SHARE);
        let mut context_items = self
            .list(MemoryLevel::Context, None)
            .await
            .map_err(storage_to_memory)?;
        context_items.sort_by_key(|item| std::cmp::Reverse(item.order().unwrap_or(i64::MIN)));
        let mut picked: Vec<&MemoryItem> = Vec::new();
        let mut used = 0u32;
        for item in &context_items {
            let cost = estimate_tokens(&item.content) + 1;
            if used + cost > context_budget {
                break;
            }
            used += cost;
            picked.push(item);
        }
        picked.reverse();
        if !picked.is_empty() {
            let body = picked
                .iter()
                .map(|item| item.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            sections.push(section("Recent context", &body, context_budget));
        }

        // Ranked matches for the remaining tiers.
        for (title, level, share_of_budget) in [
            ("Characters", MemoryLevel::Character, CHARACTER_SHARE),
            ("Plot threads", MemoryLevel::Plot, PLOT_SHARE),
            ("World", MemoryLevel::Global, GLOBAL_SHARE),
        ] {
            let tier_budget = share(budget_tokens, share_of_budget);
            let hits = self
                .search(query, Some(level), k)
                .await
                .map_err(storage_to_memory)?;
            let items: Vec<MemoryItem> = if hits.is_empty() {
                self.list(level, Some(k)).await.map_err(storage_to_memory)?
            } else {
                hits.into_iter().map(|(item, _)| item).collect()
            };
            if items.is_empty() {
                continue;
            }
            let body = items
                .iter()
                .map(|item| item.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            sections.push(section(title, &body, tier_budget));
        }

        // Style singletons.
        let style_budget = share(budget_tokens, STYLE_SHARE);
        let styles = self
            .list(MemoryLevel::Style, None)
            .await
            .map_err(storage_to_memory)?;
        if !styles.is_empty() {
            let body = styles
                .iter()
                .map(|item| match item.aspect() {
                    Some(aspect) => format!("{aspect}: {}", item.content),
                    None => item.content.clone(),
                })
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(section("Style", &body, style_budget));
        }

        let out: String = sections
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        debug_assert!(
            estimate_tokens(&out) <= budget_tokens + budget_tokens / 50 + 1,
            "context exceeded budget"
        );
        Ok(out)
    }
}

fn storage_to_memory(err: crate::error::StorageError) -> MemoryError {
    MemoryError::Store(err.to_string())
}

fn share(budget: u32, fraction: f64) -> u32 {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let tokens = (f64::from(budget) * fraction) as u32;
    tokens.max(1)
}

fn section(title: &str, body: &str, budget: u32) -> String {
    let header = format!("## {title}\n");
    let header_cost = estimate_tokens(&header);
    if header_cost >= budget {
        return String::new();
    }
    let body = fit_paragraphs(body, budget - header_cost);
    if body.is_empty() {
        return String::new();
    }
    format!("{header}{body}")
}

/// Keep whole paragraphs while they fit; when even the first paragraph
/// overflows, cut it at the last sentence end that fits.
fn fit_paragraphs(text: &str, budget: u32) -> String {
    if estimate_tokens(text) <= budget {
        return text.to_string();
    }

    let mut out = String::new();
    for paragraph in text.split("\n\n") {
        let candidate_cost = estimate_tokens(paragraph) + 1;
        let used = estimate_tokens(&out);
        if used + candidate_cost <= budget {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(paragraph);
        } else if out.is_empty() {
            out = cut_at_sentence(paragraph, budget);
            break;
        } else {
            break;
        }
    }
    out
}

fn cut_at_sentence(text: &str, budget: u32) -> String {
    let mut best_end = 0;
    for (idx, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?' | '。' | '！' | '？') {
            let end = idx + c.len_utf8();
            if estimate_tokens(&text[..end]) <= budget {
                best_end = end;
            } else {
                break;
            }
        }
    }
    if best_end > 0 {
        return text[..best_end].to_string();
    }

    // No sentence boundary fits; hard character cut.
    let mut end = 0;
    for (idx, c) in text.char_indices() {
        let next = idx + c.len_utf8();
        if estimate_tokens(&text[..next]) > budget {
            break;
        }
        end = next;
    }
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::embeddings::NoopEmbedding;
    use crate::memory::index::InMemoryVectorIndex;
    use crate::storage::InMemoryStore;
    use std::sync::Arc;

    fn memory() -> LayeredMemory {
        LayeredMemory::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryVectorIndex::new()),
            Arc::new(NoopEmbedding),
            "p1",
        )
    }

    async fn seeded() -> LayeredMemory {
        let memory = memory();
        memory
            .add_context("Lin Feng stood in the rain outside the precinct.", 1, Some(1))
            .await
            .unwrap();
        memory
            .add_context("The informant never showed.", 2, Some(1))
            .await
            .unwrap();
        memory
            .upsert_character("Lin Feng", "Lin Feng: protagonist, ex-detective, insomniac")
            .await
            .unwrap();
        memory
            .append_plot("Chapter 1: the missing AI case lands on Lin Feng's desk", Some(1))
            .await
            .unwrap();
        memory
            .add_global("Shanghai, 2077. Neon, acid rain, licensed AI only.")
            .await
            .unwrap();
        memory.upsert_style("tone", "noir").await.unwrap();
        memory
    }

    #[tokio::test]
    async fn composes_sections_in_priority_order() {
        let memory = seeded().await;
        let out = memory.build_context("Lin Feng missing AI", 800).await.unwrap();

        let ctx = out.find("## Recent context").expect("context section");
        let chars = out.find("## Characters").expect("characters section");
        let plot = out.find("## Plot threads").expect("plot section");
        let style = out.find("## Style").expect("style section");
        assert!(ctx < chars && chars < plot && plot < style);
        assert!(out.contains("ex-detective"));
    }

    #[tokio::test]
    async fn stays_within_budget_plus_slack() {
        let memory = memory();
        for order in 0..20 {
            memory
                .add_context(
                    format!("Paragraph {order}: {}", "night market haze. ".repeat(12)),
                    order,
                    None,
                )
                .await
                .unwrap();
        }
        for i in 0..10 {
            memory
                .add_global(format!("World fact {i}: {}", "the grid hums. ".repeat(10)))
                .await
                .unwrap();
        }

        for budget in [120u32, 300, 900] {
            let out = memory.build_context("night market", budget).await.unwrap();
            let tokens = estimate_tokens(&out);
            assert!(
                tokens <= budget + budget / 50 + 1,
                "budget {budget}, got {tokens}"
            );
        }
    }

    #[tokio::test]
    async fn tiny_budget_is_rejected() {
        let memory = memory();
        assert!(matches!(
            memory.build_context("q", 10).await,
            Err(MemoryError::BudgetTooSmall(_))
        ));
    }

    #[tokio::test]
    async fn newest_context_wins_under_pressure() {
        let memory = memory();
        memory
            .add_context(format!("old. {}", "filler ".repeat(200)), 1, None)
            .await
            .unwrap();
        memory.add_context("newest turn", 2, None).await.unwrap();

        let out = memory.build_context("anything", 120).await.unwrap();
        assert!(out.contains("newest turn"));
        assert!(!out.contains("old. filler"));
    }

    #[tokio::test]
    async fn empty_memory_builds_empty_string() {
        let memory = memory();
        let out = memory.build_context("query", 400).await.unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn paragraph_fitting_prefers_whole_paragraphs() {
        let text = format!("{}\n\n{}", "short paragraph.", "x".repeat(400));
        let fitted = fit_paragraphs(&text, 20);
        assert_eq!(fitted, "short paragraph.");
    }

    #[test]
    fn sentence_cut_when_first_paragraph_overflows() {
        let text = format!("First sentence. {}", "y".repeat(800));
        let fitted = fit_paragraphs(&text, 10);
        assert_eq!(fitted, "First sentence.");
    }
}
