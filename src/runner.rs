use std::num::NonZeroUsize;

use anyhow::{anyhow, Context};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::args::{Args, Command, NarrowArgs, PopulateArgs, SpanArgs, VerifyArgs};
use crate::config::Config;
use crate::pipeline::{
    narrow, populate, verify, Discrepancy, NarrowConfig, PopulateConfig, Tiling, VerifyConfig,
};
use crate::range::BlockRange;
use crate::rpc_client::{EndpointConfig, RpcClient};
use crate::source::CountSource;
use crate::store::discrepancy::normalize_provider;
use crate::store::RangeCountStore;

pub struct Runner;

impl Runner {
    pub async fn run(args: Args) -> Result<(), anyhow::Error> {
        let cfg = tokio::fs::read_to_string(&args.config_path)
            .await
            .context("read config file")?;

        let cfg: Config = toml::de::from_str(&cfg).context("parse config")?;

        let store = RangeCountStore::new(&cfg.store.database_url)
            .await
            .context("open range count store")?;

        let cancel = CancellationToken::new();
        cancel_on_ctrl_c(cancel.clone());

        let res = match args.command {
            Command::Populate(args) => run_populate(&cfg, args, &store, cancel).await,
            Command::Verify(args) => run_verify(&cfg, args, &store, cancel).await,
            Command::Narrow(args) => run_narrow(&cfg, args, &store, cancel).await,
        };

        store.close().await;

        res
    }
}

fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Received Ctrl-C, stopping the run");
            cancel.cancel();
        }
    });
}

async fn run_populate(
    cfg: &Config,
    args: PopulateArgs,
    store: &RangeCountStore,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let endpoint = endpoint_config(cfg.reference.clone(), args.provider, "reference")?;
    let client = RpcClient::new(endpoint, &cfg.rpc).context("create reference client")?;
    let source = CountSource::new(client, &cfg.rpc, cancel);

    let (span, tiling, concurrency) = span_from(cfg, &args.span)?;
    let populate_cfg = PopulateConfig {
        span,
        tiling,
        concurrency,
        split_on_error_min_width: cfg.span.split_min_width(),
    };

    let report = populate(&populate_cfg, &source, store)
        .await
        .context("populate range count store")?;

    for f in report.failed.iter() {
        log::warn!("Not populated: {} ({})", f.range, f.failure);
    }
    if let Some(remaining) = report.remaining {
        log::warn!("Cancelled, not populated: {}", remaining);
    }

    Ok(())
}

async fn run_verify(
    cfg: &Config,
    args: VerifyArgs,
    store: &RangeCountStore,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let endpoint = endpoint_config(cfg.candidate.clone(), args.test_provider, "candidate")?;
    let provider = provider_key(&endpoint);
    let client = RpcClient::new(endpoint, &cfg.rpc).context("create candidate client")?;
    let candidate = CountSource::new(client, &cfg.rpc, cancel);

    let (mut span, tiling, concurrency) = span_from(cfg, &args.span)?;

    if args.snap {
        match store
            .snap_window(span.start, span.end)
            .await
            .context("snap verification window")?
        {
            Some(snapped) => {
                log::info!("Snapped {} to stored range boundaries {}", span, snapped);
                span = snapped;
            }
            None => log::warn!("Range count store is empty, {} is not snapped", span),
        }
    }

    if args.clear {
        store
            .clear_discrepancies(&provider)
            .await
            .context("clear stored discrepancies")?;
    }

    let verify_cfg = VerifyConfig {
        span,
        tiling,
        concurrency,
        stored_ranges: args.snap,
    };

    let report = verify(&verify_cfg, &candidate, store)
        .await
        .context("verify candidate")?;

    for d in report.discrepancies() {
        store
            .record_discrepancy(&provider, d)
            .await
            .context("record discrepancy")?;
    }
    if let Some(remaining) = report.remaining {
        log::warn!("Cancelled, not verified: {}", remaining);
    }

    Ok(())
}

async fn run_narrow(
    cfg: &Config,
    args: NarrowArgs,
    store: &RangeCountStore,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let endpoint = endpoint_config(cfg.reference.clone(), args.provider, "reference")?;
    let client = RpcClient::new(endpoint, &cfg.rpc).context("create reference client")?;
    let reference = CountSource::new(client, &cfg.rpc, cancel.clone());

    let endpoint = endpoint_config(cfg.candidate.clone(), args.test_provider, "candidate")?;
    let provider = provider_key(&endpoint);
    let client = RpcClient::new(endpoint, &cfg.rpc).context("create candidate client")?;
    let candidate = CountSource::new(client, &cfg.rpc, cancel.clone());

    let narrow_cfg = NarrowConfig {
        min_width: args.min_width.unwrap_or(cfg.narrow.min_width),
    };

    let discrepancies = match (args.from, args.to) {
        (Some(from), Some(to)) => {
            let range = BlockRange::new(from, to)?;
            let reference_count = match store.get(range).await.context("read reference count")? {
                Some(record) => record.count,
                None => reference
                    .count_span(range)
                    .await
                    .with_context(|| format!("count {} on reference", range))?,
            };
            let test_count = candidate
                .count_span(range)
                .await
                .with_context(|| format!("count {} on candidate", range))?;

            if reference_count == test_count {
                log::info!("No discrepancy in {}: both providers return {}", range, test_count);
                return Ok(());
            }

            vec![Discrepancy {
                range,
                reference_count,
                test_count,
            }]
        }
        _ => store
            .discrepancies_for(&provider)
            .await
            .context("read stored discrepancies")?,
    };

    if discrepancies.is_empty() {
        log::info!("No stored discrepancies for {}", provider);
        return Ok(());
    }

    for d in discrepancies.iter() {
        if cancel.is_cancelled() {
            log::warn!("Cancelled, {} is not narrowed", d.range);
            continue;
        }

        let report = narrow(&narrow_cfg, d, &reference, &candidate).await;

        log::info!(
            "Narrowed {} in {} levels: {} results, {} inconclusive, {} inconsistencies",
            d.range,
            report.levels,
            report.results.len(),
            report.inconclusive.len(),
            report.inconsistencies.len()
        );
    }

    Ok(())
}

/// Discrepancy rows are keyed by endpoint url, labels are only used in logs.
fn provider_key(endpoint: &EndpointConfig) -> String {
    normalize_provider(endpoint.url.as_str())
}

/// `url` replaces the configured endpoint's url and label.
fn endpoint_config(
    configured: Option<EndpointConfig>,
    url: Option<Url>,
    role: &str,
) -> anyhow::Result<EndpointConfig> {
    match (configured, url) {
        (Some(endpoint), Some(url)) => Ok(EndpointConfig {
            url,
            label: None,
            ..endpoint
        }),
        (None, Some(url)) => Ok(EndpointConfig::from_url(url)),
        (Some(endpoint), None) => Ok(endpoint),
        (None, None) => Err(anyhow!(
            "no {role} provider configured, add a [{role}] table or pass its url"
        )),
    }
}

fn span_from(cfg: &Config, args: &SpanArgs) -> anyhow::Result<(BlockRange, Tiling, NonZeroUsize)> {
    let span = BlockRange::new(
        args.start.unwrap_or(cfg.span.start),
        args.end.unwrap_or(cfg.span.end),
    )
    .context("block span")?;

    let tiling = Tiling {
        range_size: args.range_size.unwrap_or(cfg.span.tiling.range_size),
        step_size: args.step_size.unwrap_or(cfg.span.tiling.step_size),
    };

    Ok((span, tiling, args.concurrency.unwrap_or(cfg.span.concurrency)))
}
