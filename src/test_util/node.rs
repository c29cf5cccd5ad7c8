use crate::config::LwCommConfig;
use crate::topology::node::Node;
use crate::topology::route::{Route, RouteMode};

/// convenience method for unit test code: a node on localhost with the given port
pub fn test_node(name: &str, port: u16) -> Node {
    Node::new(name, "127.0.0.1", port)
}

/// A [LwCommConfig::local_test] configuration with the given nodes. Their ports are assigned in
///  order starting at 1, consistent with [test_node].
pub fn test_config(local_node: &str, node_names: &[&str]) -> anyhow::Result<LwCommConfig> {
    let nodes = node_names.iter()
        .enumerate()
        .map(|(i, name)| test_node(name, i as u16 + 1));
    LwCommConfig::local_test(local_node, nodes)
}

/// adds a route between nodes that are configured already
pub fn add_test_route(
    config: &mut LwCommConfig,
    name: &str,
    mode: RouteMode,
    sources: &[&str],
    destinations: &[&str],
    retransmit_pattern_millis: &[u64],
) -> anyhow::Result<()> {
    let destinations = destinations.iter()
        .map(|name| config.node(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("node {} is not configured", name))
        )
        .collect::<anyhow::Result<Vec<_>>>()?;

    let route = Route::with_pattern_millis(name, mode, sources.iter().copied(), destinations, retransmit_pattern_millis)?;
    config.add_route(route)
}
