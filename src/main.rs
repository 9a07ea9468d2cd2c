use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

use artbroker::appraisal::{AppraisalQueue, Appraiser, HttpOracle, NullOracle, Oracle, TagPolicy};
use artbroker::config::Config;
use artbroker::fetch::download_image;
use artbroker::gallery::{DisplayLocation, MemoryGallery};
use artbroker::listing::Listing;
use artbroker::logging::{log, obj, v_str, Domain, Level};
use artbroker::market::Marketplace;
use artbroker::store::Store;
use artbroker::trends::spawn_daily_decay;

fn print_usage() {
    eprintln!("Usage: artbroker <command> [args]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  serve                          Run the decay scheduler and read commands from stdin");
    eprintln!("  upload <user> <path|url>       Appraise and list an image");
    eprintln!("  buy <user> <item>              Buy an item on sale");
    eprintln!("  buy-at <user> <thread> <msg>   Buy the item shown by a gallery post");
    eprintln!("  force-buy <user> <item>        Buy out a locked item at the premium");
    eprintln!("  lock <user> <item>             Lock an owned item");
    eprintln!("  unlock <user> <item>           Unlock an owned item");
    eprintln!("  resell <user> <item> <price>   Put an owned item back on sale");
    eprintln!("  join <user> <name>             Register a gallery and collect the welcome bonus");
    eprintln!("  balance <user>                 Show a balance");
    eprintln!("  inventory <user>               List items owned by a user");
    eprintln!("  market                         Show the latest items on sale");
    eprintln!("  decay                          Run trend decay now");
    eprintln!("  reset-risk                     Forget all image fingerprints");
    eprintln!("  reset                          Wipe the whole store");
}

fn arg<'a>(args: &'a [String], idx: usize, what: &str) -> Result<&'a str> {
    args.get(idx)
        .map(|s| s.as_str())
        .ok_or_else(|| anyhow!("missing argument <{}>", what))
}

fn num<T: std::str::FromStr>(args: &[String], idx: usize, what: &str) -> Result<T> {
    let raw = arg(args, idx, what)?;
    raw.parse().map_err(|_| anyhow!("invalid <{}>: {}", what, raw))
}

fn build_oracle(url: &Option<String>, cfg: &Config) -> Result<Arc<dyn Oracle>> {
    match url {
        Some(endpoint) => Ok(Arc::new(HttpOracle::new(
            endpoint.clone(),
            cfg.hf_token.clone(),
            cfg.appraisal_timeout(),
        )?)),
        None => Ok(Arc::new(NullOracle)),
    }
}

fn describe(listing: &Listing) -> String {
    let owner = listing
        .owner()
        .map(|o| o.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "#{} {} {} price={} owner={} locked={} tags=[{}]",
        listing.item_id,
        listing.grade.as_str(),
        listing.status.as_str(),
        listing.price,
        owner,
        listing.is_locked,
        listing.tags.join(", ")
    )
}

async fn dispatch(market: &Marketplace, http: &reqwest::Client, args: &[String]) -> Result<()> {
    let cmd = arg(args, 0, "command")?;
    match cmd {
        "upload" => {
            let user: u64 = num(args, 1, "user")?;
            let source = arg(args, 2, "path|url")?;
            let bytes = if source.starts_with("http://") || source.starts_with("https://") {
                download_image(http, source).await?
            } else {
                std::fs::read(source).with_context(|| format!("reading {}", source))?
            };
            let receipt = market.upload(user, source, &bytes).await?;
            println!(
                "listed #{} grade={} score={:.2} paid={} ask={} fallback={} tags=[{}]",
                receipt.item_id,
                receipt.grade.as_str(),
                receipt.score,
                receipt.payout,
                receipt.listing_price,
                receipt.appraisal_fallback,
                receipt.tags.join(", ")
            );
        }
        "buy" | "force-buy" => {
            let user: u64 = num(args, 1, "user")?;
            let item: i64 = num(args, 2, "item")?;
            let s = if cmd == "buy" {
                market.buy(user, item).await?
            } else {
                market.force_buy(user, item).await?
            };
            println!(
                "bought #{} paid={} seller={} payout={} burned={}",
                s.item_id, s.paid, s.seller, s.payout, s.burned
            );
        }
        "buy-at" => {
            let location = DisplayLocation {
                thread_id: num(args, 2, "thread")?,
                message_id: num(args, 3, "message")?,
            };
            let s = market.buy_at(num(args, 1, "user")?, location).await?;
            println!("bought #{} paid={} seller={} payout={}", s.item_id, s.paid, s.seller, s.payout);
        }
        "lock" => {
            let listing = market.lock(num(args, 1, "user")?, num(args, 2, "item")?).await?;
            println!("{}", describe(&listing));
        }
        "unlock" => {
            let listing = market.unlock(num(args, 1, "user")?, num(args, 2, "item")?).await?;
            println!("{}", describe(&listing));
        }
        "resell" => {
            let listing = market
                .resell(num(args, 1, "user")?, num(args, 2, "item")?, num(args, 3, "price")?)
                .await?;
            println!("{}", describe(&listing));
        }
        "join" => {
            let user: u64 = num(args, 1, "user")?;
            let name = args.get(2..).map(|rest| rest.join(" ")).unwrap_or_default();
            let name = if name.is_empty() { user.to_string() } else { name };
            let reg = market.join(user, &name).await?;
            if reg.created {
                println!("gallery thread {} created, bonus {}", reg.thread_id, reg.bonus);
            } else {
                println!("gallery thread {} already registered", reg.thread_id);
            }
        }
        "balance" => {
            let user: u64 = num(args, 1, "user")?;
            println!("{}", market.balance(user).await?);
        }
        "inventory" => {
            let user: u64 = num(args, 1, "user")?;
            for listing in market.inventory(user).await? {
                println!("{}", describe(&listing));
            }
        }
        "market" => {
            for listing in market.market().await? {
                println!("{}", describe(&listing));
            }
        }
        "decay" => println!("decayed {} tags", market.decay_trends().await?),
        "reset-risk" => println!("cleared {} fingerprints", market.reset_risk().await?),
        "reset" => {
            market.reset().await?;
            println!("store wiped");
        }
        other => bail!("unknown command: {}", other),
    }
    Ok(())
}

/// Long-running mode: one gallery and one appraisal worker shared by every
/// command read from stdin, daily decay in the background.
async fn serve(market: &Marketplace, http: &reqwest::Client) -> Result<()> {
    let cfg = market.config();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let decay = spawn_daily_decay(market.store().clone(), cfg.decay_hour_utc, shutdown_rx);
    log(
        Level::Info,
        Domain::System,
        "serve_started",
        obj(&[("decay_hour_utc", json!(cfg.decay_hour_utc)), ("forum", v_str(&cfg.gallery_forum))]),
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let args: Vec<String> = line.split_whitespace().map(str::to_string).collect();
                if args.is_empty() {
                    continue;
                }
                if let Err(err) = dispatch(market, http, &args).await {
                    eprintln!("error: {:#}", err);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = decay.await;
    log(Level::Info, Domain::System, "serve_stopped", obj(&[]));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        print_usage();
        std::process::exit(1);
    }

    let cfg = Config::from_env();
    let store = Store::open(&cfg.sqlite_path)?;
    let queue = Arc::new(AppraisalQueue::start(
        build_oracle(&cfg.tagger_url, &cfg)?,
        build_oracle(&cfg.scorer_url, &cfg)?,
    ));
    let appraiser = Appraiser::new(queue.clone(), cfg.appraisal_timeout(), TagPolicy::from_config(&cfg));
    // posts live only in this process; keep new ids clear of ones already stored
    let display_floor = {
        let uow = store.begin().await?;
        uow.max_display_id()?
    };
    let gallery = Arc::new(
        MemoryGallery::new()
            .with_forum(&cfg.gallery_forum)
            .ids_after(display_floor),
    );
    let market = Marketplace::new(cfg, store, gallery, appraiser);
    let http = reqwest::Client::new();

    let result = if args[0] == "serve" {
        serve(&market, &http).await
    } else {
        dispatch(&market, &http, &args).await
    };
    queue.shutdown().await;
    result
}
