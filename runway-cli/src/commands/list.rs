//! Read-only listing commands

use anyhow::Result;
use chrono::Utc;
use futures::StreamExt;
use runway_core::{AssetNode, PartitionDimension, PartitionKey, PipelineDefinition};
use std::collections::BTreeSet;

use super::range_from_bounds;
use crate::config;

/// Print every asset in topological order
pub fn list_assets(definition: &PipelineDefinition) -> Result<()> {
    let graph = &definition.graph;

    println!(
        "{:<24} {:<10} {:<20} {:<12} UPSTREAM",
        "ASSET", "GROUP", "PARTITIONS", "POLICY"
    );
    for name in graph.topological_order() {
        let node = graph.node(&name)?;
        let upstream: Vec<String> = graph
            .upstream(&name)?
            .iter()
            .map(|dep| format!("{} ({})", dep.asset.name, dep.mapping.type_name()))
            .collect();

        println!(
            "{:<24} {:<10} {:<20} {:<12} {}",
            node.name,
            node.group.as_deref().unwrap_or("-"),
            describe_partitions(node),
            node.policy.as_str(),
            if upstream.is_empty() {
                "-".to_string()
            } else {
                upstream.join(", ")
            }
        );
    }

    println!();
    println!("{} asset(s), {} dependency edge(s)", graph.len(), graph.edge_count());
    Ok(())
}

fn describe_partitions(node: &AssetNode) -> String {
    match &node.partitions {
        PartitionDimension::None => "unpartitioned".to_string(),
        PartitionDimension::Daily { start_date } => format!("daily from {}", start_date),
        PartitionDimension::Custom { keys } => format!("custom ({} keys)", keys.len()),
    }
}

/// Print the catalog records of one asset's partitions
pub async fn list_partitions(
    definition: &PipelineDefinition,
    asset: &str,
    from: Option<&str>,
    to: Option<&str>,
) -> Result<()> {
    let node = definition.graph.node(asset)?;
    let range = range_from_bounds(from, to)?;
    let catalog = config::open_catalog(&definition.settings).await?;

    println!(
        "{:<14} {:<12} {:>8}  {:<25} {:<16} BLOCKED BY",
        "PARTITION", "STATE", "ROWS", "LAST SUCCESS", "FINGERPRINT"
    );

    let mut recorded: BTreeSet<PartitionKey> = BTreeSet::new();
    let mut records = catalog.list_partitions(asset, range.clone());
    while let Some(record) = records.next().await {
        let record = record?;
        println!(
            "{:<14} {:<12} {:>8}  {:<25} {:<16} {}",
            record.key.as_str(),
            record.state.as_str(),
            record
                .row_count
                .map_or_else(|| "-".to_string(), |n| n.to_string()),
            record
                .last_success_at
                .map_or_else(|| "-".to_string(), |t| t.to_rfc3339()),
            short_fingerprint(record.input_fingerprint.as_str()),
            record
                .blocked_by
                .as_ref()
                .map_or_else(|| "-".to_string(), |p| p.to_string()),
        );
        recorded.insert(record.key);
    }

    let today = Utc::now().date_naive();
    let never_materialized = node
        .partitions
        .keys_in_range(&range, today)
        .into_iter()
        .filter(|key| !recorded.contains(key))
        .count();

    println!();
    println!(
        "{} recorded partition(s), {} never materialized",
        recorded.len(),
        never_materialized
    );
    Ok(())
}

fn short_fingerprint(hex: &str) -> &str {
    hex.get(..16).unwrap_or(hex)
}
