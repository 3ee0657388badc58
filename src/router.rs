//! TranslationRouter - picks a direct model or a two-hop path through the
//! pivot language, then runs it under a deadline.

use crate::error::RouteError;
use crate::language::{LanguageCode, LanguagePair};
use crate::registry::ModelRegistry;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// How a request travels from source to target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Source and target are the same language.
    Identity,
    Direct(LanguagePair),
    Pivot {
        first: LanguagePair,
        second: LanguagePair,
    },
}

impl Route {
    pub fn hops(&self) -> Vec<LanguagePair> {
        match *self {
            Route::Identity => Vec::new(),
            Route::Direct(pair) => vec![pair],
            Route::Pivot { first, second } => vec![first, second],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutedTranslation {
    pub text: String,
    /// Other hypotheses of the final hop, best first.
    pub alternatives: Vec<String>,
    pub path: Vec<LanguagePair>,
}

fn stranded(path: &[LanguagePair]) -> RouteError {
    RouteError::NoRouteAvailable {
        from: path.first().map(|p| p.source.to_string()).unwrap_or_default(),
        to: path.last().map(|p| p.target.to_string()).unwrap_or_default(),
    }
}

/// Up to `limit` candidates, dropping blanks, repeats and `best` itself.
fn distinct_alternatives(
    best: &str,
    candidates: impl IntoIterator<Item = String>,
    limit: usize,
) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::from([best.to_string(), String::new()]);
    candidates
        .into_iter()
        .filter(|c| seen.insert(c.clone()))
        .take(limit)
        .collect()
}

pub struct TranslationRouter {
    registry: Arc<ModelRegistry>,
    pivot: LanguageCode,
}

impl TranslationRouter {
    pub fn new(registry: Arc<ModelRegistry>, pivot: &str) -> Result<Self, RouteError> {
        let pivot = LanguageCode::parse(pivot)
            .map_err(|_| RouteError::UnsupportedLanguage(pivot.to_string()))?;
        Ok(Self { registry, pivot })
    }

    pub fn pivot(&self) -> LanguageCode {
        self.pivot
    }

    /// Pick a route using only currently loaded models. A direct model always
    /// wins over a pivot path.
    pub fn resolve(&self, source: LanguageCode, target: LanguageCode) -> Result<Route, RouteError> {
        if source == target {
            return Ok(Route::Identity);
        }

        let direct = LanguagePair::new(source, target);
        if self.registry.is_loaded(direct) {
            return Ok(Route::Direct(direct));
        }

        if source != self.pivot && target != self.pivot {
            let first = LanguagePair::new(source, self.pivot);
            let second = LanguagePair::new(self.pivot, target);
            if self.registry.is_loaded(first) && self.registry.is_loaded(second) {
                return Ok(Route::Pivot { first, second });
            }
        }

        Err(RouteError::NoRouteAvailable {
            from: source.to_string(),
            to: target.to_string(),
        })
    }

    /// Translate `text`, failing with `Timeout` if every hop has not finished
    /// within `deadline`. Backend errors are returned as-is, never retried.
    pub async fn translate(
        &self,
        text: &str,
        source: LanguageCode,
        target: LanguageCode,
        deadline: Duration,
    ) -> Result<RoutedTranslation, RouteError> {
        self.translate_with_alternatives(text, source, target, deadline, 0)
            .await
    }

    /// Like [`translate`](Self::translate), also asking the final hop for up
    /// to `alternatives` other hypotheses.
    pub async fn translate_with_alternatives(
        &self,
        text: &str,
        source: LanguageCode,
        target: LanguageCode,
        deadline: Duration,
        alternatives: usize,
    ) -> Result<RoutedTranslation, RouteError> {
        let route = self.resolve(source, target)?;
        self.execute(route, text, deadline, alternatives).await
    }

    /// Run an already resolved route. Fails with `NoRouteAvailable` if a hop
    /// was unloaded since the route was resolved.
    pub async fn execute(
        &self,
        route: Route,
        text: &str,
        deadline: Duration,
        alternatives: usize,
    ) -> Result<RoutedTranslation, RouteError> {
        let path = route.hops();

        // Lease every hop before running the first so an unload cannot
        // strand a request halfway along a pivot path.
        let mut leases = Vec::with_capacity(path.len());
        for hop in &path {
            let lease = self
                .registry
                .lease(*hop)
                .ok_or_else(|| stranded(&path))?;
            leases.push(lease);
        }
        debug!(?route, alternatives, "routing translation");

        let run = async {
            let mut current = text.to_string();
            let mut others = Vec::new();
            let last = leases.len().saturating_sub(1);
            for (i, lease) in leases.iter().enumerate() {
                let hop = lease.pair();
                let translator = lease.translator();
                if i == last && alternatives > 0 {
                    let mut hypotheses = translator
                        .hypotheses(&current, hop.source, hop.target, alternatives.saturating_add(1))
                        .await
                        .map_err(|e| RouteError::InferenceFailure(e.to_string()))?
                        .into_iter();
                    current = hypotheses.next().ok_or_else(|| {
                        RouteError::InferenceFailure(format!("{} returned no hypotheses", hop))
                    })?;
                    others = distinct_alternatives(&current, hypotheses, alternatives);
                } else {
                    current = translator
                        .translate(&current, hop.source, hop.target)
                        .await
                        .map_err(|e| RouteError::InferenceFailure(e.to_string()))?;
                }
            }
            Ok::<_, RouteError>((current, others))
        };

        let (translated, alternatives) = tokio::time::timeout(deadline, run)
            .await
            .map_err(|_| RouteError::Timeout(deadline))??;

        Ok(RoutedTranslation {
            text: translated,
            alternatives,
            path,
        })
    }

    /// For every loaded source language, the targets reachable directly or
    /// through the pivot.
    pub fn reachable_targets(&self) -> BTreeMap<LanguageCode, BTreeSet<LanguageCode>> {
        let pairs = self.registry.loaded_pairs();
        let mut graph: BTreeMap<LanguageCode, BTreeSet<LanguageCode>> = BTreeMap::new();

        for pair in &pairs {
            graph.entry(pair.source).or_default().insert(pair.target);
        }
        let from_pivot: Vec<LanguageCode> = pairs
            .iter()
            .filter(|p| p.source == self.pivot)
            .map(|p| p.target)
            .collect();
        for pair in pairs.iter().filter(|p| p.target == self.pivot) {
            let targets = graph.entry(pair.source).or_default();
            targets.extend(from_pivot.iter().filter(|t| **t != pair.source));
        }
        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{code, pair, Behavior, Fixture};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::Ordering;

    const DEADLINE: Duration = Duration::from_secs(5);

    async fn router(pairs: &[(&str, &str)]) -> (Fixture, TranslationRouter) {
        let fixture = Fixture::with_pairs(pairs).await;
        let router = TranslationRouter::new(Arc::clone(&fixture.registry), "en").unwrap();
        (fixture, router)
    }

    #[tokio::test]
    async fn pivots_through_english() {
        let (_fixture, router) = router(&[("es", "en"), ("en", "fr")]).await;

        let result = router
            .translate("Hola", code("es"), code("fr"), DEADLINE)
            .await
            .unwrap();

        assert_eq!(result.text, "Bonjour");
        assert_eq!(result.path, vec![pair("es", "en"), pair("en", "fr")]);
    }

    #[tokio::test]
    async fn prefers_direct_model() {
        let (_fixture, router) = router(&[("es", "en"), ("en", "fr"), ("es", "fr")]).await;

        assert_eq!(
            router.resolve(code("es"), code("fr")).unwrap(),
            Route::Direct(pair("es", "fr"))
        );
    }

    #[tokio::test]
    async fn resolution_is_deterministic() {
        let (_fixture, router) = router(&[("es", "en"), ("en", "fr"), ("de", "en")]).await;

        let first = router.resolve(code("es"), code("fr")).unwrap();
        for _ in 0..20 {
            assert_eq!(router.resolve(code("es"), code("fr")).unwrap(), first);
        }
    }

    #[tokio::test]
    async fn same_language_is_identity() {
        let (fixture, router) = router(&[]).await;

        let result = router
            .translate("Hola", code("es"), code("es"), DEADLINE)
            .await
            .unwrap();

        assert_eq!(result.text, "Hola");
        assert!(result.path.is_empty());
        assert_eq!(fixture.loader.calls.load(Ordering::SeqCst), 0);
    }

    fn es_to_fr_unavailable() -> RouteError {
        RouteError::NoRouteAvailable {
            from: "es".to_string(),
            to: "fr".to_string(),
        }
    }

    #[tokio::test]
    async fn missing_hop_means_no_route() {
        for unloaded in [pair("es", "en"), pair("en", "fr")] {
            let (fixture, router) = router(&[("es", "en"), ("en", "fr")]).await;
            fixture.registry.unload(unloaded).await.unwrap();

            let err = router
                .translate("Hola", code("es"), code("fr"), DEADLINE)
                .await
                .unwrap_err();

            assert_eq!(err, es_to_fr_unavailable(), "with {} unloaded", unloaded);
        }
    }

    #[tokio::test]
    async fn unload_after_resolve_means_no_route() {
        for unloaded in [pair("es", "en"), pair("en", "fr")] {
            let (fixture, router) = router(&[("es", "en"), ("en", "fr")]).await;
            let route = router.resolve(code("es"), code("fr")).unwrap();
            fixture.registry.unload(unloaded).await.unwrap();

            let err = router.execute(route, "Hola", DEADLINE, 0).await.unwrap_err();

            assert_eq!(err, es_to_fr_unavailable(), "with {} unloaded", unloaded);
            assert_eq!(fixture.loader.calls.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn alternatives_come_from_the_last_hop_without_repeats() {
        let (_fixture, router) = router(&[("es", "en"), ("en", "fr")]).await;

        let result = router
            .translate_with_alternatives("Hola", code("es"), code("fr"), DEADLINE, 4)
            .await
            .unwrap();

        assert_eq!(result.text, "Bonjour");
        assert_eq!(result.alternatives, vec!["Bonjour!", "Bonjour?"]);
    }

    #[tokio::test]
    async fn alternatives_are_capped_at_the_requested_count() {
        let (_fixture, router) = router(&[("es", "en")]).await;

        let result = router
            .translate_with_alternatives("Hola", code("es"), code("en"), DEADLINE, 1)
            .await
            .unwrap();

        assert_eq!(result.text, "Hello");
        // Two hypotheses requested; the second repeats the best one.
        assert!(result.alternatives.is_empty());
    }

    #[test]
    fn distinct_alternatives_drop_blanks_and_repeats() {
        let candidates = ["Hi", "", "Hello", "Hi", "Hey"].map(str::to_string);
        assert_eq!(
            distinct_alternatives("Hello", candidates, 5),
            vec!["Hi".to_string(), "Hey".to_string()]
        );
    }

    #[tokio::test]
    async fn never_searches_beyond_two_hops() {
        // es->de->en->fr would need three hops.
        let (_fixture, router) = router(&[("es", "de"), ("de", "en"), ("en", "fr")]).await;
        assert!(router.resolve(code("es"), code("fr")).is_err());
    }

    async fn reload_with(fixture: &Fixture, hop: LanguagePair, behavior: Behavior) {
        fixture.registry.unload(hop).await.unwrap();
        fixture.loader.set(hop, behavior);
        fixture.registry.load(hop).await.unwrap();
    }

    #[tokio::test]
    async fn inference_failure_is_not_retried() {
        let (fixture, router) = router(&[("es", "en")]).await;
        reload_with(&fixture, pair("es", "en"), Behavior::Fail("model crashed".to_string())).await;

        let err = router
            .translate("Hola", code("es"), code("en"), DEADLINE)
            .await
            .unwrap_err();

        assert!(matches!(err, RouteError::InferenceFailure(msg) if msg.contains("model crashed")));
        assert_eq!(fixture.loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_model_times_out() {
        let (fixture, router) = router(&[("es", "en")]).await;
        reload_with(&fixture, pair("es", "en"), Behavior::Slow(Duration::from_secs(60))).await;

        tokio::time::pause();
        let err = router
            .translate("Hola", code("es"), code("en"), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert_eq!(err, RouteError::Timeout(Duration::from_secs(1)));
        // Leases are released once the request gives up.
        assert_eq!(fixture.registry.list_models().await.unwrap()[0].in_flight, 0);
    }

    #[tokio::test]
    async fn unknown_pivot_is_rejected() {
        let fixture = Fixture::with_pairs(&[]).await;
        let err = TranslationRouter::new(Arc::clone(&fixture.registry), "xx").err();
        assert_eq!(err, Some(RouteError::UnsupportedLanguage("xx".to_string())));
    }

    #[tokio::test]
    async fn reachable_targets_include_pivot_paths() {
        let (_fixture, router) = router(&[("es", "en"), ("en", "fr"), ("en", "es")]).await;

        let graph = router.reachable_targets();

        let es: Vec<_> = graph[&code("es")].iter().map(|c| c.as_str()).collect();
        assert_eq!(es, vec!["en", "fr"]);
        let en: Vec<_> = graph[&code("en")].iter().map(|c| c.as_str()).collect();
        assert_eq!(en, vec!["es", "fr"]);
    }
}
