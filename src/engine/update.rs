//! Configuration-update state preservation.
//!
//! An update rebuilds the whole graph, then carries runtime state over
//! for components whose definition closure is unchanged: a metric (and
//! a condition's slice map) survives when its own definition and the
//! definitions of everything it references are identical between the
//! old and new configurations. Indices are remapped through the new
//! tables; anything whose upstream changed starts fresh.

use super::build::BuiltGraph;
use crate::condition::ConditionKind;
use crate::core::config::{EngineConfig, MatcherSpec, MetricConfig, PredicateSpec, ProducerConfig};
use crate::metrics::MetricKind;

pub(crate) fn preserve_components(
    old_config: &EngineConfig,
    new_config: &EngineConfig,
    old_graph: &mut BuiltGraph,
    new_graph: &mut BuiltGraph,
    now_ns: i64,
) {
    // Old matcher index -> new matcher index, via ids.
    let old_to_new_matcher: Vec<Option<usize>> = old_graph
        .matchers
        .iter()
        .map(|m| new_graph.matcher_index_by_id.get(&m.id).copied())
        .collect();

    // Conditions: adopt slice state where the definition closure held.
    for new_index in 0..new_graph.conditions.len() {
        let id = new_graph.conditions[new_index].id;
        if !predicate_def_equal(old_config, new_config, id) {
            continue;
        }
        let Some(&old_index) = old_graph.condition_index_by_id.get(&id) else {
            continue;
        };
        let old_condition = &mut old_graph.conditions[old_index];
        new_graph.conditions[new_index].state = old_condition.state;
        if let (ConditionKind::Simple(new_simple), ConditionKind::Simple(old_simple)) = (
            &mut new_graph.conditions[new_index].kind,
            &mut old_condition.kind,
        ) {
            new_simple.adopt_runtime(old_simple.take_runtime());
        }
    }

    // Metric cores cached their condition's state at build time, before
    // the slice maps above were adopted; re-sync them.
    for metric in &mut new_graph.metrics {
        if let Some(ci) = metric.core.condition_index {
            metric.core.condition = new_graph.conditions[ci].state;
        }
    }

    // Metrics: move producer state and activation state across.
    let mut preserved_metric_ids = Vec::new();
    for new_index in 0..new_graph.metrics.len() {
        let id = new_graph.metrics[new_index].core.metric_id;
        let Some(new_mc) = new_config.metrics.iter().find(|m| m.id == id) else {
            continue;
        };
        if !metric_preservable(old_config, new_config, new_mc) {
            continue;
        }
        let Some(&old_index) = old_graph.metric_index_by_id.get(&id) else {
            continue;
        };
        preserved_metric_ids.push(id);

        let old_metric = &mut old_graph.metrics[old_index];
        let new_metric = &mut new_graph.metrics[new_index];

        let snapshots: Vec<_> = old_metric
            .write_active_state(now_ns)
            .into_iter()
            .filter_map(|mut snapshot| {
                snapshot.matcher_index = (*old_to_new_matcher.get(snapshot.matcher_index)?)?;
                Some(snapshot)
            })
            .collect();
        new_metric.load_active_state(&snapshots, now_ns);

        let mut kind = std::mem::replace(&mut old_metric.kind, placeholder());
        if let MetricKind::Duration(duration) = &mut kind {
            if let Some(Some(start)) = old_to_new_matcher.get(duration.start_index) {
                duration.start_index = *start;
            }
            duration.stop_index = duration
                .stop_index
                .and_then(|i| old_to_new_matcher.get(i).copied().flatten());
            duration.stop_all_index = duration
                .stop_all_index
                .and_then(|i| old_to_new_matcher.get(i).copied().flatten());
        }
        new_metric.kind = kind;

        new_metric.core.current_bucket_start_ns = old_metric.core.current_bucket_start_ns;
        new_metric.core.condition_timer = old_metric.core.condition_timer.clone();
        new_metric.core.rng = old_metric.core.rng.clone();
        new_metric.core.guardrail.hit = old_metric.core.guardrail.hit;
    }

    // Alerts: keep refractory state when the alert and its metric held.
    for new_index in 0..new_graph.alerts.len() {
        let config = new_graph.alerts[new_index].config.clone();
        let unchanged = old_config.alerts.iter().any(|a| *a == config)
            && preserved_metric_ids.contains(&config.metric_id);
        if !unchanged {
            continue;
        }
        let Some(old_alert) = old_graph.alerts.iter().find(|a| a.config.id == config.id) else {
            continue;
        };
        if let Some(metadata) = old_alert.write_metadata() {
            new_graph.alerts[new_index].load_metadata(&metadata);
        }
    }
}

fn placeholder() -> MetricKind {
    MetricKind::Count(crate::metrics::CountMetric::new())
}

fn matcher_def_equal(old_config: &EngineConfig, new_config: &EngineConfig, id: i64) -> bool {
    let old = old_config.matchers.iter().find(|m| m.id == id);
    let new = new_config.matchers.iter().find(|m| m.id == id);
    let (Some(old), Some(new)) = (old, new) else {
        return false;
    };
    if old.spec != new.spec {
        return false;
    }
    match &new.spec {
        MatcherSpec::Simple { .. } => true,
        MatcherSpec::Combination { matcher_ids, .. } => matcher_ids
            .iter()
            .all(|&child| matcher_def_equal(old_config, new_config, child)),
    }
}

fn predicate_def_equal(old_config: &EngineConfig, new_config: &EngineConfig, id: i64) -> bool {
    let old = old_config.predicates.iter().find(|p| p.id == id);
    let new = new_config.predicates.iter().find(|p| p.id == id);
    let (Some(old), Some(new)) = (old, new) else {
        return false;
    };
    if old.spec != new.spec {
        return false;
    }
    match &new.spec {
        PredicateSpec::Simple {
            start_matcher_id,
            stop_matcher_id,
            stop_all_matcher_id,
            ..
        } => [start_matcher_id, stop_matcher_id, stop_all_matcher_id]
            .into_iter()
            .flatten()
            .all(|&matcher| matcher_def_equal(old_config, new_config, matcher)),
        PredicateSpec::Combination { predicate_ids, .. } => predicate_ids
            .iter()
            .all(|&child| predicate_def_equal(old_config, new_config, child)),
    }
}

fn metric_preservable(
    old_config: &EngineConfig,
    new_config: &EngineConfig,
    new_mc: &MetricConfig,
) -> bool {
    let Some(old_mc) = old_config.metrics.iter().find(|m| m.id == new_mc.id) else {
        return false;
    };
    if old_mc != new_mc {
        return false;
    }
    let what_equal = match &new_mc.producer {
        ProducerConfig::Count { what_matcher_id }
        | ProducerConfig::Event { what_matcher_id }
        | ProducerConfig::Value { what_matcher_id, .. }
        | ProducerConfig::Gauge { what_matcher_id, .. } => {
            matcher_def_equal(old_config, new_config, *what_matcher_id)
        }
        ProducerConfig::Duration { what_predicate_id, .. } => {
            predicate_def_equal(old_config, new_config, *what_predicate_id)
        }
    };
    if !what_equal {
        return false;
    }
    if let Some(condition_id) = new_mc.condition_id {
        if !predicate_def_equal(old_config, new_config, condition_id) {
            return false;
        }
    }
    new_mc.activations.iter().all(|activation| {
        matcher_def_equal(old_config, new_config, activation.matcher_id)
            && activation
                .deactivation_matcher_id
                .map_or(true, |d| matcher_def_equal(old_config, new_config, d))
    })
}
