//! Declarative shard plan.
//!
//! Symbols are partitioned across connections by liquidity tier:
//! high-tier symbols get the full channel set (including depth when
//! enabled) in small per-connection groups; everything else shares larger
//! connections without depth. Mark price and force order channels ride on
//! their own shards covering the whole universe, since their cadence is
//! low. If the plan would exceed the connection bound, per-connection
//! group sizes are scaled up until it fits.

use serde::Serialize;

use crate::config::{ChannelSettings, ShardSettings, SymbolSettings};
use crate::schema::ChannelKind;

/// Liquidity tier of a shard's symbol set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LiquidityTier {
    High,
    Low,
    /// Whole-universe shards for low-cadence channels.
    Broadcast,
}

/// One planned connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardSpec {
    pub id: usize,
    pub tier: LiquidityTier,
    pub channels: Vec<ChannelKind>,
    pub symbols: Vec<String>,
}

impl ShardSpec {
    /// Stream identifiers for the subscription message.
    pub fn stream_names(&self) -> Vec<String> {
        let mut streams = Vec::with_capacity(self.symbols.len() * self.channels.len());
        for symbol in &self.symbols {
            for channel in &self.channels {
                streams.push(format!(
                    "{}@{}",
                    symbol.to_lowercase(),
                    channel.stream_suffix()
                ));
            }
        }
        streams
    }
}

/// A full partitioning of the universe into connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardPlan {
    pub shards: Vec<ShardSpec>,
}

/// Difference between two plans, used for minimal-diff rebalancing: a
/// shard present in both plans with identical channels and symbols keeps
/// its connection.
#[derive(Debug, Default)]
pub struct PlanDiff {
    pub added: Vec<ShardSpec>,
    pub removed: Vec<usize>,
    pub unchanged: Vec<usize>,
}

impl ShardPlan {
    /// Build a plan for the given universe.
    pub fn build(
        symbols: &[String],
        channels: &[ChannelKind],
        symbol_settings: &SymbolSettings,
        shard_settings: &ShardSettings,
    ) -> Self {
        let mut high: Vec<String> = Vec::new();
        let mut low: Vec<String> = Vec::new();
        for symbol in symbols {
            let symbol = symbol.to_uppercase();
            if symbol_settings.top_tier.contains(&symbol) {
                high.push(symbol);
            } else {
                low.push(symbol);
            }
        }

        // Broadcast channels get their own shards over the whole universe.
        let per_symbol_channels: Vec<ChannelKind> = channels
            .iter()
            .copied()
            .filter(|c| {
                matches!(
                    c,
                    ChannelKind::BookTicker | ChannelKind::AggTrade | ChannelKind::Depth
                )
            })
            .collect();
        let broadcast_channels: Vec<ChannelKind> = channels
            .iter()
            .copied()
            .filter(|c| matches!(c, ChannelKind::MarkPrice | ChannelKind::ForceOrder))
            .collect();

        // Depth is restricted to the high tier; low tier carries the rest.
        let high_channels = per_symbol_channels.clone();
        let low_channels: Vec<ChannelKind> = per_symbol_channels
            .iter()
            .copied()
            .filter(|c| *c != ChannelKind::Depth)
            .collect();

        let mut high_chunk = shard_settings.high_tier_symbols_per_connection.max(1);
        let mut low_chunk = shard_settings.low_tier_symbols_per_connection.max(1);
        let broadcast_shards = usize::from(!broadcast_channels.is_empty());

        // Grow group sizes until the plan fits the connection bound.
        loop {
            let count = shard_count(&high, high_chunk)
                + shard_count(&low, low_chunk)
                + broadcast_shards;
            if count <= shard_settings.max_connections
                || (high_chunk >= high.len().max(1) && low_chunk >= low.len().max(1))
            {
                break;
            }
            high_chunk *= 2;
            low_chunk *= 2;
        }

        let mut shards = Vec::new();
        let mut next_id = 0;

        if !high_channels.is_empty() {
            for chunk in high.chunks(high_chunk) {
                shards.push(ShardSpec {
                    id: next_id,
                    tier: LiquidityTier::High,
                    channels: high_channels.clone(),
                    symbols: chunk.to_vec(),
                });
                next_id += 1;
            }
        }
        if !low_channels.is_empty() {
            for chunk in low.chunks(low_chunk) {
                shards.push(ShardSpec {
                    id: next_id,
                    tier: LiquidityTier::Low,
                    channels: low_channels.clone(),
                    symbols: chunk.to_vec(),
                });
                next_id += 1;
            }
        }
        if !broadcast_channels.is_empty() {
            let mut all: Vec<String> = high.iter().chain(low.iter()).cloned().collect();
            all.sort();
            shards.push(ShardSpec {
                id: next_id,
                tier: LiquidityTier::Broadcast,
                channels: broadcast_channels,
                symbols: all,
            });
        }

        ShardPlan { shards }
    }

    /// Build from settings directly.
    pub fn from_settings(
        symbols: &[String],
        channel_settings: &ChannelSettings,
        symbol_settings: &SymbolSettings,
        shard_settings: &ShardSettings,
    ) -> Self {
        Self::build(
            symbols,
            &channel_settings.enabled(),
            symbol_settings,
            shard_settings,
        )
    }

    /// Total planned connections.
    pub fn connection_count(&self) -> usize {
        self.shards.len()
    }

    /// Compute the minimal diff against a currently running plan.
    pub fn diff(&self, current: &ShardPlan) -> PlanDiff {
        let mut diff = PlanDiff::default();

        for shard in &self.shards {
            let same = current
                .shards
                .iter()
                .find(|s| s.channels == shard.channels && s.symbols == shard.symbols);
            match same {
                Some(existing) => diff.unchanged.push(existing.id),
                None => diff.added.push(shard.clone()),
            }
        }

        for shard in &current.shards {
            let kept = self
                .shards
                .iter()
                .any(|s| s.channels == shard.channels && s.symbols == shard.symbols);
            if !kept {
                diff.removed.push(shard.id);
            }
        }

        diff
    }
}

fn shard_count(symbols: &[String], chunk: usize) -> usize {
    if symbols.is_empty() {
        0
    } else {
        symbols.len().div_ceil(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ShardSettings, SymbolSettings};

    fn universe(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("SYM{}USDT", i)).collect()
    }

    fn symbol_settings_with_top(top: &[String]) -> SymbolSettings {
        SymbolSettings {
            top_tier: top.to_vec(),
            ..SymbolSettings::default()
        }
    }

    #[test]
    fn test_high_tier_gets_depth_low_tier_does_not() {
        let symbols = vec!["BTCUSDT".to_string(), "OBSCUREUSDT".to_string()];
        let settings = symbol_settings_with_top(&["BTCUSDT".to_string()]);
        let plan = ShardPlan::build(
            &symbols,
            &[
                ChannelKind::BookTicker,
                ChannelKind::AggTrade,
                ChannelKind::Depth,
            ],
            &settings,
            &ShardSettings::default(),
        );

        let high = plan
            .shards
            .iter()
            .find(|s| s.tier == LiquidityTier::High)
            .unwrap();
        assert!(high.channels.contains(&ChannelKind::Depth));
        assert_eq!(high.symbols, vec!["BTCUSDT"]);

        let low = plan
            .shards
            .iter()
            .find(|s| s.tier == LiquidityTier::Low)
            .unwrap();
        assert!(!low.channels.contains(&ChannelKind::Depth));
        assert_eq!(low.symbols, vec!["OBSCUREUSDT"]);
    }

    #[test]
    fn test_connection_bound_is_respected() {
        let symbols = universe(200);
        let settings = symbol_settings_with_top(&symbols[..20]);
        let shard_settings = ShardSettings {
            max_connections: 8,
            ..ShardSettings::default()
        };
        let plan = ShardPlan::build(
            &symbols,
            &[ChannelKind::BookTicker, ChannelKind::AggTrade],
            &settings,
            &shard_settings,
        );

        assert!(plan.connection_count() <= 8);

        // Every symbol must land somewhere.
        let mut covered: Vec<&String> = plan.shards.iter().flat_map(|s| &s.symbols).collect();
        covered.sort();
        covered.dedup();
        assert_eq!(covered.len(), 200);
    }

    #[test]
    fn test_broadcast_shard_for_mark_price() {
        let symbols = universe(10);
        let settings = symbol_settings_with_top(&[]);
        let plan = ShardPlan::build(
            &symbols,
            &[ChannelKind::BookTicker, ChannelKind::MarkPrice],
            &settings,
            &ShardSettings::default(),
        );

        let broadcast = plan
            .shards
            .iter()
            .find(|s| s.tier == LiquidityTier::Broadcast)
            .unwrap();
        assert_eq!(broadcast.channels, vec![ChannelKind::MarkPrice]);
        assert_eq!(broadcast.symbols.len(), 10);
    }

    #[test]
    fn test_stream_names() {
        let spec = ShardSpec {
            id: 0,
            tier: LiquidityTier::High,
            channels: vec![ChannelKind::BookTicker, ChannelKind::Depth],
            symbols: vec!["BTCUSDT".to_string()],
        };
        assert_eq!(
            spec.stream_names(),
            vec!["btcusdt@bookTicker", "btcusdt@depth@100ms"]
        );
    }

    #[test]
    fn test_diff_is_minimal() {
        let symbols = universe(40);
        let settings = symbol_settings_with_top(&[]);
        let shard_settings = ShardSettings {
            low_tier_symbols_per_connection: 10,
            ..ShardSettings::default()
        };
        let channels = [ChannelKind::BookTicker];

        let current = ShardPlan::build(&symbols, &channels, &settings, &shard_settings);
        assert_eq!(current.connection_count(), 4);

        // Appending ten symbols adds one shard and must not disturb the
        // four whose membership is unchanged.
        let mut grown = symbols.clone();
        grown.extend(universe(50).into_iter().skip(40));
        let next = ShardPlan::build(&grown, &channels, &settings, &shard_settings);

        let diff = next.diff(&current);
        assert_eq!(diff.unchanged.len(), 4);
        assert_eq!(diff.added.len(), 1);
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn test_identical_plans_diff_to_nothing() {
        let symbols = universe(20);
        let settings = symbol_settings_with_top(&[]);
        let plan = ShardPlan::build(
            &symbols,
            &[ChannelKind::BookTicker],
            &settings,
            &ShardSettings::default(),
        );
        let diff = plan.diff(&plan);
        assert!(diff.added.is_empty());
        assert!(diff.removed.is_empty());
        assert_eq!(diff.unchanged.len(), plan.shards.len());
    }
}
