use crate::model::InputDescriptor;
use crate::persistence::PersistenceRegistry;
use crate::protocol::{ConnectionHandle, ConnectionOptions, TimeseriesInput};
use crate::status::EngineStats;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Diff of a desired input set against the running connections. Removals
/// are applied before additions within one pass, so a connection never
/// holds two inputs for the same logical address.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct ConnectionPlan {
    pub remove_connections: Vec<String>,
    pub remove_inputs: Vec<(String, String)>,
    pub attach_inputs: Vec<InputDescriptor>,
    pub create_connections: Vec<(String, Vec<InputDescriptor>)>,
}

impl ConnectionPlan {
    pub(crate) fn is_empty(&self) -> bool {
        self.remove_connections.is_empty()
            && self.remove_inputs.is_empty()
            && self.attach_inputs.is_empty()
            && self.create_connections.is_empty()
    }
}

/// Pure diff against actual running state (never against a change log), so
/// a repeated pass with an unchanged desired set plans zero actions.
pub(crate) fn plan(
    running: &HashMap<String, HashSet<String>>,
    desired: &[InputDescriptor],
) -> ConnectionPlan {
    let desired_connections: HashSet<&str> = desired
        .iter()
        .map(|input| input.connection.id.as_str())
        .collect();
    let desired_inputs: HashSet<&str> = desired.iter().map(|input| input.id.as_str()).collect();

    let mut plan = ConnectionPlan::default();

    plan.remove_connections = running
        .keys()
        .filter(|id| !desired_connections.contains(id.as_str()))
        .cloned()
        .collect();
    plan.remove_connections.sort();

    for (connection_id, attached) in running {
        if !desired_connections.contains(connection_id.as_str()) {
            continue;
        }
        for input_id in attached {
            if !desired_inputs.contains(input_id.as_str()) {
                plan.remove_inputs
                    .push((connection_id.clone(), input_id.clone()));
            }
        }
    }
    plan.remove_inputs.sort();

    let running_inputs: HashSet<&str> = running
        .values()
        .flat_map(|ids| ids.iter().map(String::as_str))
        .collect();
    let mut create: BTreeMap<String, Vec<InputDescriptor>> = BTreeMap::new();
    for input in desired {
        if running_inputs.contains(input.id.as_str()) {
            continue;
        }
        match running.get(&input.connection.id) {
            Some(_) => plan.attach_inputs.push(input.clone()),
            None => create
                .entry(input.connection.id.clone())
                .or_default()
                .push(input.clone()),
        }
    }
    plan.create_connections = create.into_iter().collect();
    plan
}

pub struct ConnectionReconciler {
    registry: Arc<PersistenceRegistry>,
    stats: Arc<EngineStats>,
    options: ConnectionOptions,
    stop_timeout: Duration,
    running: HashMap<String, ConnectionHandle>,
}

impl ConnectionReconciler {
    pub fn new(
        registry: Arc<PersistenceRegistry>,
        stats: Arc<EngineStats>,
        options: ConnectionOptions,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            stats,
            options,
            stop_timeout,
            running: HashMap::new(),
        }
    }

    /// One pass converging the running set onto `desired`. Each desired
    /// input must reference a valid connection and backend descriptor.
    pub async fn reconcile(&mut self, desired: &[InputDescriptor]) {
        let snapshot: HashMap<String, HashSet<String>> = self
            .running
            .iter()
            .map(|(id, handle)| (id.clone(), handle.input_ids().clone()))
            .collect();
        let plan = plan(&snapshot, desired);
        if plan.is_empty() {
            return;
        }

        for connection_id in &plan.remove_connections {
            if let Some(handle) = self.running.remove(connection_id) {
                tracing::info!(connection = %connection_id, "disconnecting removed connection");
                handle.disconnect(self.stop_timeout).await;
            }
        }

        for (connection_id, input_id) in &plan.remove_inputs {
            if let Some(handle) = self.running.get_mut(connection_id) {
                tracing::info!(connection = %connection_id, sensor = %input_id, "detaching input");
                handle.remove_input(input_id).await;
            }
        }

        for descriptor in &plan.attach_inputs {
            let Some(input) = build_input(&self.registry, descriptor) else {
                continue;
            };
            if let Some(handle) = self.running.get_mut(&descriptor.connection.id) {
                tracing::info!(
                    connection = %descriptor.connection.id,
                    sensor = %descriptor.id,
                    "attaching input to running connection"
                );
                handle.add_input(input).await;
            }
        }

        for (connection_id, inputs) in &plan.create_connections {
            let descriptor = inputs[0].connection.clone();
            let credentials = match descriptor.resolve_credentials() {
                Ok(credentials) => credentials,
                Err(err) => {
                    // skip this connection only; the rest of the pass
                    // proceeds unaffected
                    tracing::warn!(
                        connection = %connection_id,
                        error = %err,
                        "credentials unresolved; connection skipped"
                    );
                    continue;
                }
            };
            let attached: Vec<TimeseriesInput> = inputs
                .iter()
                .filter_map(|input| build_input(&self.registry, input))
                .collect();
            tracing::info!(
                connection = %connection_id,
                inputs = attached.len(),
                "starting connection"
            );
            let handle = ConnectionHandle::start(descriptor, credentials, attached, self.options.clone());
            self.running.insert(connection_id.clone(), handle);
        }

        self.stats
            .active_connections
            .store(self.running.len(), Ordering::Relaxed);
        tracing::debug!(
            connections = self.running.len(),
            connected = self.running.values().filter(|handle| handle.is_active()).count(),
            "connection reconcile pass complete"
        );
    }

    pub fn active_count(&self) -> usize {
        self.running.len()
    }

    pub async fn shutdown(&mut self) {
        for (_, handle) in self.running.drain() {
            tracing::info!(connection = %handle.id(), "disconnecting for shutdown");
            handle.disconnect(self.stop_timeout).await;
        }
        self.stats.active_connections.store(0, Ordering::Relaxed);
    }
}

fn build_input(
    registry: &PersistenceRegistry,
    descriptor: &InputDescriptor,
) -> Option<TimeseriesInput> {
    match registry.handler_for(&descriptor.backend) {
        Ok(handler) => Some(TimeseriesInput::new(
            &descriptor.id,
            &descriptor.address,
            handler,
        )),
        Err(err) => {
            tracing::warn!(
                sensor = %descriptor.id,
                backend = %descriptor.backend.id,
                error = %err,
                "persistence handler unavailable; input skipped"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BackendDescriptor, BackendKind, ConnectionDescriptor, ProtocolKind};

    fn input(connection_id: &str, input_id: &str) -> InputDescriptor {
        InputDescriptor {
            id: input_id.to_string(),
            address: format!("plant/{connection_id}/{input_id}"),
            connection: ConnectionDescriptor {
                id: connection_id.to_string(),
                kind: ProtocolKind::Mqtt,
                host: "127.0.0.1".to_string(),
                port: 1883,
                username_env: None,
                password_env: None,
                unit: None,
                poll_interval_ms: None,
            },
            backend: BackendDescriptor {
                id: "ts-main".to_string(),
                kind: BackendKind::Timeseries,
                url: "postgres://twin@db/twin".to_string(),
            },
        }
    }

    fn running(entries: &[(&str, &[&str])]) -> HashMap<String, HashSet<String>> {
        entries
            .iter()
            .map(|(connection_id, inputs)| {
                (
                    connection_id.to_string(),
                    inputs.iter().map(|id| id.to_string()).collect(),
                )
            })
            .collect()
    }

    fn apply(state: &mut HashMap<String, HashSet<String>>, plan: &ConnectionPlan) {
        for connection_id in &plan.remove_connections {
            state.remove(connection_id);
        }
        for (connection_id, input_id) in &plan.remove_inputs {
            state.get_mut(connection_id).unwrap().remove(input_id);
        }
        for input in &plan.attach_inputs {
            state
                .get_mut(&input.connection.id)
                .unwrap()
                .insert(input.id.clone());
        }
        for (connection_id, inputs) in &plan.create_connections {
            state.insert(
                connection_id.clone(),
                inputs.iter().map(|input| input.id.clone()).collect(),
            );
        }
    }

    #[test]
    fn plans_the_minimal_set_of_actions() {
        let state = running(&[("A", &["ts1", "ts2"]), ("C", &["ts4"])]);
        let desired = vec![input("A", "ts1"), input("A", "ts2"), input("B", "ts3")];
        let plan = plan(&state, &desired);

        assert_eq!(plan.remove_connections, vec!["C".to_string()]);
        assert!(plan.remove_inputs.is_empty());
        assert!(plan.attach_inputs.is_empty());
        assert_eq!(plan.create_connections.len(), 1);
        assert_eq!(plan.create_connections[0].0, "B");
        assert_eq!(plan.create_connections[0].1[0].id, "ts3");
    }

    #[test]
    fn repeated_pass_with_unchanged_desired_state_plans_nothing() {
        let mut state = running(&[("A", &["ts1", "ts2"]), ("C", &["ts4"])]);
        let desired = vec![input("A", "ts1"), input("A", "ts2"), input("B", "ts3")];

        let first = plan(&state, &desired);
        apply(&mut state, &first);
        let second = plan(&state, &desired);
        assert!(second.is_empty());
    }

    #[test]
    fn input_sets_shrink_and_grow_without_restarting_the_connection() {
        let state = running(&[("A", &["ts1", "ts2"])]);
        let desired = vec![input("A", "ts1"), input("A", "ts3")];
        let plan = plan(&state, &desired);

        assert!(plan.remove_connections.is_empty());
        assert_eq!(
            plan.remove_inputs,
            vec![("A".to_string(), "ts2".to_string())]
        );
        assert_eq!(plan.attach_inputs.len(), 1);
        assert_eq!(plan.attach_inputs[0].id, "ts3");
        assert!(plan.create_connections.is_empty());
    }

    #[test]
    fn empty_desired_state_tears_everything_down() {
        let state = running(&[("A", &["ts1"]), ("B", &["ts2"])]);
        let plan = plan(&state, &[]);
        assert_eq!(
            plan.remove_connections,
            vec!["A".to_string(), "B".to_string()]
        );
        assert!(plan.create_connections.is_empty());
    }
}
