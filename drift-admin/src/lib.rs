// Admin surface: operator-facing commands layered over a node's config and
// logging, no protocol logic of its own (spec.md §1 lists "the
// packaging/build system" and related operational concerns as external
// collaborators the core never depends on). Kept intentionally thin --
// this crate exists so the workspace's crate layout has a place for
// things like "drain this node" or "report this node's config" without
// any of that leaking into `drift-txn`.

use tracing::info;

use drift_base::NodeConfig;

/// An administrative action an operator (or an orchestrator) can apply to
/// a running node. What each variant actually *does* is left to the
/// embedder; this crate only standardizes their shape and logs them.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AdminCommand {
    /// Stop accepting new coordinator work; let in-flight transactions
    /// finish.
    Drain,
    /// Report the node's current static configuration.
    ReportConfig,
}

pub fn apply(config: &NodeConfig, command: AdminCommand) {
    match command {
        AdminCommand::Drain => {
            info!(node_id = config.node_id, "draining node");
        }
        AdminCommand::ReportConfig => {
            info!(?config, "reporting node config");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn test_apply_does_not_panic_for_every_command() {
        let config = NodeConfig::default();
        apply(&config, AdminCommand::Drain);
        apply(&config, AdminCommand::ReportConfig);
    }
}
