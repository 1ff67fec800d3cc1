//! Compiles a declarative configuration into the evaluation graph.
//!
//! Components are referenced by position, never by owning pointer;
//! combinations must reference strictly earlier indices, which makes
//! the topological-order invariant structural and cycles impossible.
//! Every cross-reference is validated here; the first violation rejects
//! the whole configuration.

use crate::alerts::AlertTracker;
use crate::condition::{
    initialize_states, input_matchers, wizard, CombinationCondition, Condition, ConditionKind,
    ConditionState, SimpleCondition,
};
use crate::core::config::{
    clamp_bucket_width_ns, EngineConfig, MatcherSpec, PredicateInitialValue, PredicateSpec,
    ProducerConfig,
};
use crate::core::diagnostics::EngineDiagnostics;
use crate::core::error::{ComponentKind, InvalidConfigReason};
use crate::dimension::{contains_any_position, FieldLink, LinkTarget};
use crate::external::Collaborators;
use crate::matcher::{
    AtomMatcher, CombinationMatcher, LogicalOperation, MatcherKind, SimpleMatcher,
};
use crate::metrics::bucket::ConditionTimer;
use crate::metrics::{
    ActivationMap, CountMetric, DimensionGuardrail, DurationMetric, EventMetric, GaugeMetric,
    Metric, MetricCore, MetricKind, ValueMetric,
};
use crate::sampling::DimensionalSampler;
use ahash::AHashMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;

/// Most matchers a single configuration may declare.
pub const MAX_MATCHERS_PER_CONFIG: usize = 2500;
/// Most predicates a single configuration may declare.
pub const MAX_CONDITIONS_PER_CONFIG: usize = 1200;
/// Most metrics a single configuration may declare.
pub const MAX_METRICS_PER_CONFIG: usize = 3000;
/// Most alerts a single configuration may declare.
pub const MAX_ALERTS_PER_CONFIG: usize = 100;
/// Most allowed log sources a single configuration may declare.
pub const MAX_LOG_SOURCES_PER_CONFIG: usize = 50;

/// The compiled evaluation graph: four component vectors plus the index
/// tables encoding the dataflow edges between them.
#[derive(Debug, Default)]
pub(crate) struct BuiltGraph {
    pub matchers: Vec<AtomMatcher>,
    pub conditions: Vec<Condition>,
    pub metrics: Vec<Metric>,
    pub alerts: Vec<AlertTracker>,
    /// Atom tag to the matchers interested in it.
    pub tag_to_matchers: AHashMap<u32, Vec<usize>>,
    /// Matcher to the conditions it feeds (transitively).
    pub matcher_to_conditions: AHashMap<usize, Vec<usize>>,
    /// Condition to the metrics gated on it.
    pub condition_to_metrics: AHashMap<usize, Vec<usize>>,
    /// Matcher to the metrics consuming its matches.
    pub matcher_to_metrics: AHashMap<usize, Vec<usize>>,
    /// Activation matcher to the metrics it activates.
    pub activation_to_metrics: AHashMap<usize, Vec<usize>>,
    /// Deactivation matcher to the metrics it cancels.
    pub deactivation_to_metrics: AHashMap<usize, Vec<usize>>,
    /// Metrics carrying activation records.
    pub metrics_with_activation: Vec<usize>,
    /// Metric to the alerts watching it.
    pub metric_to_alerts: AHashMap<usize, Vec<usize>>,
    pub matcher_index_by_id: AHashMap<i64, usize>,
    pub condition_index_by_id: AHashMap<i64, usize>,
    pub metric_index_by_id: AHashMap<i64, usize>,
}

pub(crate) fn build_graph(
    config: &EngineConfig,
    time_base_ns: i64,
    current_time_ns: i64,
    collaborators: &Collaborators,
    diagnostics: &Arc<EngineDiagnostics>,
) -> Result<BuiltGraph, InvalidConfigReason> {
    if config.matchers.len() > MAX_MATCHERS_PER_CONFIG {
        return Err(InvalidConfigReason::TooManyMatchers(config.matchers.len()));
    }
    if config.predicates.len() > MAX_CONDITIONS_PER_CONFIG {
        return Err(InvalidConfigReason::TooManyConditions(config.predicates.len()));
    }
    if config.metrics.len() > MAX_METRICS_PER_CONFIG {
        return Err(InvalidConfigReason::TooManyMetrics(config.metrics.len()));
    }
    if config.alerts.len() > MAX_ALERTS_PER_CONFIG {
        return Err(InvalidConfigReason::TooManyAlerts(config.alerts.len()));
    }
    let source_count = config.allowed_log_sources.len() + config.allowed_source_uids.len();
    if source_count > MAX_LOG_SOURCES_PER_CONFIG {
        return Err(InvalidConfigReason::TooManyLogSources(source_count));
    }

    let mut graph = BuiltGraph::default();
    build_matchers(config, &mut graph)?;
    build_conditions(config, &mut graph)?;
    build_metrics(config, current_time_ns, time_base_ns, collaborators, diagnostics, &mut graph)?;
    build_alerts(config, collaborators, diagnostics, &mut graph)?;
    Ok(graph)
}

fn build_matchers(config: &EngineConfig, graph: &mut BuiltGraph) -> Result<(), InvalidConfigReason> {
    for (index, mc) in config.matchers.iter().enumerate() {
        if graph.matcher_index_by_id.insert(mc.id, index).is_some() {
            return Err(InvalidConfigReason::DuplicateId { id: mc.id });
        }
        let kind = match &mc.spec {
            MatcherSpec::Simple { atom_id, field_matchers, transforms } => {
                MatcherKind::Simple(SimpleMatcher {
                    atom_id: *atom_id,
                    field_matchers: field_matchers.clone(),
                    transforms: transforms.clone(),
                })
            }
            MatcherSpec::Combination { operation, matcher_ids } => {
                if *operation == LogicalOperation::Not && matcher_ids.len() != 1 {
                    return Err(InvalidConfigReason::BadNotArity { id: mc.id });
                }
                let mut children = Vec::with_capacity(matcher_ids.len());
                for child_id in matcher_ids {
                    let child = *graph
                        .matcher_index_by_id
                        .get(child_id)
                        .ok_or(InvalidConfigReason::MatcherNotFound { matcher_id: *child_id })?;
                    if child >= index {
                        return Err(InvalidConfigReason::NotTopological {
                            component: ComponentKind::Matcher,
                            id: mc.id,
                        });
                    }
                    children.push(child);
                }
                MatcherKind::Combination(CombinationMatcher {
                    operation: *operation,
                    children,
                })
            }
        };
        graph.matchers.push(AtomMatcher { id: mc.id, kind });
    }

    for index in 0..graph.matchers.len() {
        for tag in graph.matchers[index].atom_ids(&graph.matchers) {
            graph.tag_to_matchers.entry(tag).or_default().push(index);
        }
    }
    Ok(())
}

fn build_conditions(config: &EngineConfig, graph: &mut BuiltGraph) -> Result<(), InvalidConfigReason> {
    for (index, pc) in config.predicates.iter().enumerate() {
        if graph.condition_index_by_id.insert(pc.id, index).is_some() {
            return Err(InvalidConfigReason::DuplicateId { id: pc.id });
        }
        let kind = match &pc.spec {
            PredicateSpec::Simple {
                start_matcher_id,
                stop_matcher_id,
                stop_all_matcher_id,
                count_nesting,
                initial_value,
                dimensions,
            } => {
                if start_matcher_id.is_none() && stop_matcher_id.is_none() {
                    return Err(InvalidConfigReason::PredicateWithoutMatchers {
                        predicate_id: pc.id,
                    });
                }
                if contains_any_position(dimensions) {
                    return Err(InvalidConfigReason::AnyPositionInDimensions { id: pc.id });
                }
                let resolve = |id: &Option<i64>| -> Result<Option<usize>, InvalidConfigReason> {
                    match id {
                        None => Ok(None),
                        Some(matcher_id) => graph
                            .matcher_index_by_id
                            .get(matcher_id)
                            .copied()
                            .map(Some)
                            .ok_or(InvalidConfigReason::MatcherNotFound {
                                matcher_id: *matcher_id,
                            }),
                    }
                };
                let initial = match initial_value {
                    PredicateInitialValue::False => ConditionState::False,
                    PredicateInitialValue::Unknown => ConditionState::Unknown,
                    PredicateInitialValue::True => ConditionState::True,
                };
                ConditionKind::Simple(SimpleCondition::new(
                    resolve(start_matcher_id)?,
                    resolve(stop_matcher_id)?,
                    resolve(stop_all_matcher_id)?,
                    *count_nesting,
                    initial,
                    dimensions.clone(),
                ))
            }
            PredicateSpec::Combination { operation, predicate_ids } => {
                if *operation == LogicalOperation::Not && predicate_ids.len() != 1 {
                    return Err(InvalidConfigReason::BadNotArity { id: pc.id });
                }
                let mut children = Vec::with_capacity(predicate_ids.len());
                for child_id in predicate_ids {
                    let child = *graph.condition_index_by_id.get(child_id).ok_or(
                        InvalidConfigReason::ConditionNotFound { condition_id: *child_id },
                    )?;
                    if child >= index {
                        return Err(InvalidConfigReason::NotTopological {
                            component: ComponentKind::Condition,
                            id: pc.id,
                        });
                    }
                    children.push(child);
                }
                ConditionKind::Combination(CombinationCondition {
                    operation: *operation,
                    children,
                })
            }
        };
        graph.conditions.push(Condition {
            id: pc.id,
            state: ConditionState::Unknown,
            kind,
        });
    }

    initialize_states(&mut graph.conditions);

    for index in 0..graph.conditions.len() {
        for matcher_index in input_matchers(&graph.conditions, index) {
            graph
                .matcher_to_conditions
                .entry(matcher_index)
                .or_default()
                .push(index);
        }
    }
    Ok(())
}

fn build_metrics(
    config: &EngineConfig,
    current_time_ns: i64,
    time_base_ns: i64,
    collaborators: &Collaborators,
    diagnostics: &Arc<EngineDiagnostics>,
    graph: &mut BuiltGraph,
) -> Result<(), InvalidConfigReason> {
    let seed_base = config.sampling_seed.unwrap_or_else(rand::random);

    for (index, mc) in config.metrics.iter().enumerate() {
        if graph.metric_index_by_id.insert(mc.id, index).is_some() {
            return Err(InvalidConfigReason::DuplicateId { id: mc.id });
        }
        if contains_any_position(&mc.dimensions_in_what) {
            return Err(InvalidConfigReason::AnyPositionInDimensions { id: mc.id });
        }
        for link in mc.condition_links.iter().chain(mc.state_links.iter()) {
            if contains_any_position(&link.fields_in_what)
                || contains_any_position(&link.fields_in_target)
            {
                return Err(InvalidConfigReason::AnyPositionInDimensions { id: mc.id });
            }
        }
        if let Some(percentage) = mc.sampling_percentage {
            if percentage == 0 || percentage > 100 {
                return Err(InvalidConfigReason::BadSamplingPercentage {
                    metric_id: mc.id,
                    percentage,
                });
            }
        }
        let dimensional_sampler = match &mc.dimensional_sampling {
            None => None,
            Some(spec) => {
                if spec.shard_count == 0 {
                    return Err(InvalidConfigReason::ZeroShardCount { metric_id: mc.id });
                }
                if spec.sampled_what_field.any {
                    return Err(InvalidConfigReason::AnyPositionInDimensions { id: mc.id });
                }
                Some(DimensionalSampler {
                    sampled_field: spec.sampled_what_field,
                    shard_count: spec.shard_count,
                })
            }
        };

        let condition_index = match mc.condition_id {
            None => None,
            Some(condition_id) => Some(
                *graph
                    .condition_index_by_id
                    .get(&condition_id)
                    .ok_or(InvalidConfigReason::ConditionNotFound { condition_id })?,
            ),
        };
        let condition_sliced = !mc.condition_links.is_empty();
        let has_links_to_all_condition_dimensions = match (condition_index, condition_sliced) {
            (Some(ci), true) if mc.condition_links.len() == 1 => wizard::equal_output_dimensions(
                &graph.conditions,
                ci,
                &mc.condition_links[0].fields_in_target,
            ),
            _ => false,
        };

        // The kind decides which matchers feed this metric.
        let kind = match &mc.producer {
            ProducerConfig::Count { what_matcher_id } => {
                let what = resolve_matcher(graph, mc.id, *what_matcher_id)?;
                graph.matcher_to_metrics.entry(what).or_default().push(index);
                MetricKind::Count(CountMetric::new())
            }
            ProducerConfig::Event { what_matcher_id } => {
                let what = resolve_matcher(graph, mc.id, *what_matcher_id)?;
                graph.matcher_to_metrics.entry(what).or_default().push(index);
                MetricKind::Event(EventMetric::new())
            }
            ProducerConfig::Value { what_matcher_id, value_field, aggregation, pull_atom_id } => {
                let what = resolve_matcher(graph, mc.id, *what_matcher_id)?;
                graph.matcher_to_metrics.entry(what).or_default().push(index);
                MetricKind::Value(ValueMetric::new(
                    *value_field,
                    *aggregation,
                    *pull_atom_id,
                    Arc::clone(&collaborators.puller),
                ))
            }
            ProducerConfig::Gauge { what_matcher_id, fields, sampling, pull_atom_id } => {
                let what = resolve_matcher(graph, mc.id, *what_matcher_id)?;
                graph.matcher_to_metrics.entry(what).or_default().push(index);
                MetricKind::Gauge(GaugeMetric::new(
                    fields.clone(),
                    *sampling,
                    *pull_atom_id,
                    Arc::clone(&collaborators.puller),
                ))
            }
            ProducerConfig::Duration { what_predicate_id, aggregation, min_duration } => {
                let what_condition = *graph.condition_index_by_id.get(what_predicate_id).ok_or(
                    InvalidConfigReason::MetricWhatNotFound {
                        metric_id: mc.id,
                        what_id: *what_predicate_id,
                    },
                )?;
                let ConditionKind::Simple(simple) = &graph.conditions[what_condition].kind else {
                    return Err(InvalidConfigReason::DurationWhatNotSimple { metric_id: mc.id });
                };
                let Some(start_index) = simple.start_index else {
                    return Err(InvalidConfigReason::PredicateWithoutMatchers {
                        predicate_id: *what_predicate_id,
                    });
                };
                for matcher in [Some(start_index), simple.stop_index, simple.stop_all_index]
                    .into_iter()
                    .flatten()
                {
                    graph.matcher_to_metrics.entry(matcher).or_default().push(index);
                }
                MetricKind::Duration(DurationMetric::new(
                    start_index,
                    simple.stop_index,
                    simple.stop_all_index,
                    simple.count_nesting,
                    *aggregation,
                    min_duration.map(|d| d.as_nanos() as i64),
                ))
            }
        };

        if let Some(ci) = condition_index {
            graph.condition_to_metrics.entry(ci).or_default().push(index);
        }

        let mut activations = ActivationMap::new();
        for activation in &mc.activations {
            let matcher_index = *graph.matcher_index_by_id.get(&activation.matcher_id).ok_or(
                InvalidConfigReason::ActivationMatcherNotFound {
                    metric_id: mc.id,
                    matcher_id: activation.matcher_id,
                },
            )?;
            activations.add_activation(matcher_index, activation.ttl.as_nanos() as i64);
            graph.activation_to_metrics.entry(matcher_index).or_default().push(index);
            if let Some(deactivation_id) = activation.deactivation_matcher_id {
                let deactivation_index =
                    *graph.matcher_index_by_id.get(&deactivation_id).ok_or(
                        InvalidConfigReason::ActivationMatcherNotFound {
                            metric_id: mc.id,
                            matcher_id: deactivation_id,
                        },
                    )?;
                activations.add_cancellation(deactivation_index, matcher_index);
                graph
                    .deactivation_to_metrics
                    .entry(deactivation_index)
                    .or_default()
                    .push(index);
            }
        }
        if !activations.is_empty() {
            graph.metrics_with_activation.push(index);
        }

        let is_active = activations.is_active();
        let condition = condition_index
            .map(|ci| graph.conditions[ci].state)
            .unwrap_or(ConditionState::Unknown);
        let timer_on = is_active
            && match condition_index {
                None => true,
                Some(_) => !condition_sliced && condition.is_true(),
            };

        let core = MetricCore {
            metric_id: mc.id,
            time_base_ns,
            bucket_size_ns: clamp_bucket_width_ns(mc.bucket, mc.id),
            current_bucket_start_ns: current_time_ns,
            condition_index,
            condition,
            condition_sliced,
            condition_links: normalize_links(&mc.condition_links, LinkKindFilter::Condition),
            state_links: normalize_links(&mc.state_links, LinkKindFilter::State),
            slice_by_state: mc.slice_by_state.clone(),
            dimensions_in_what: mc.dimensions_in_what.clone(),
            activations,
            is_active,
            split_on_app_upgrade: mc.split_on_app_upgrade,
            omit_empty_buckets: mc.omit_empty_buckets,
            sampling_percentage: mc.sampling_percentage,
            dimensional_sampler,
            has_links_to_all_condition_dimensions,
            rng: StdRng::seed_from_u64(seed_base.wrapping_add(mc.id as u64)),
            guardrail: DimensionGuardrail::new(
                mc.id,
                mc.soft_dimension_limit,
                mc.hard_dimension_limit,
                Arc::clone(diagnostics),
            ),
            condition_timer: ConditionTimer::new(timer_on, current_time_ns),
            diagnostics: Arc::clone(diagnostics),
            sealed_outbox: Vec::new(),
            slice_outbox: Vec::new(),
        };
        graph.metrics.push(Metric { core, kind });
    }
    Ok(())
}

enum LinkKindFilter {
    Condition,
    State,
}

fn normalize_links(links: &[FieldLink], filter: LinkKindFilter) -> Vec<FieldLink> {
    links
        .iter()
        .filter(|link| match filter {
            LinkKindFilter::Condition => matches!(link.target, LinkTarget::Condition { .. }),
            LinkKindFilter::State => matches!(link.target, LinkTarget::State { .. }),
        })
        .cloned()
        .collect()
}

fn resolve_matcher(
    graph: &BuiltGraph,
    metric_id: i64,
    matcher_id: i64,
) -> Result<usize, InvalidConfigReason> {
    graph
        .matcher_index_by_id
        .get(&matcher_id)
        .copied()
        .ok_or(InvalidConfigReason::MetricWhatNotFound { metric_id, what_id: matcher_id })
}

fn build_alerts(
    config: &EngineConfig,
    collaborators: &Collaborators,
    diagnostics: &Arc<EngineDiagnostics>,
    graph: &mut BuiltGraph,
) -> Result<(), InvalidConfigReason> {
    let mut seen = AHashMap::new();
    for (index, ac) in config.alerts.iter().enumerate() {
        if seen.insert(ac.id, index).is_some() {
            return Err(InvalidConfigReason::DuplicateId { id: ac.id });
        }
        if ac.num_buckets == 0 {
            return Err(InvalidConfigReason::AlertZeroBuckets { alert_id: ac.id });
        }
        let metric_index = *graph.metric_index_by_id.get(&ac.metric_id).ok_or(
            InvalidConfigReason::AlertMetricNotFound {
                alert_id: ac.id,
                metric_id: ac.metric_id,
            },
        )?;
        graph.metric_to_alerts.entry(metric_index).or_default().push(index);
        graph.alerts.push(AlertTracker::new(
            ac.clone(),
            metric_index,
            Arc::clone(&collaborators.alarms),
            Arc::clone(diagnostics),
        ));
    }
    Ok(())
}
