use std::path::Path;

use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use common::{Candle, CurrencyPair, Error, MarketEvent, Result, Trade};

/// Largest trade batch handed to the advisor in one event.
const MAX_BATCH: usize = 500;

/// One line of a recorded feed (JSON lines).
///
/// ```json
/// {"type":"trade","exchange":"paper","pair":"BTC_USDT","price":64000.5,"volume":0.01,"timestamp":"2024-05-01T00:00:01Z","side":"buy"}
/// {"type":"candle","exchange":"paper","candle":{...}}
/// ```
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FeedRecord {
    Trade {
        exchange: String,
        pair: CurrencyPair,
        #[serde(flatten)]
        trade: Trade,
    },
    Candle {
        exchange: String,
        candle: Candle,
    },
}

/// Groups consecutive trades of the same market into one event.
#[derive(Debug, Default)]
struct Batcher {
    market: Option<(String, CurrencyPair)>,
    trades: Vec<Trade>,
}

impl Batcher {
    fn push(&mut self, exchange: String, pair: CurrencyPair, trade: Trade) -> Option<MarketEvent> {
        let same = self
            .market
            .as_ref()
            .is_some_and(|(e, p)| *e == exchange && *p == pair);
        let flushed = if same && self.trades.len() < MAX_BATCH { None } else { self.flush() };
        self.market = Some((exchange, pair));
        self.trades.push(trade);
        flushed
    }

    fn flush(&mut self) -> Option<MarketEvent> {
        let (exchange, pair) = self.market.take()?;
        if self.trades.is_empty() {
            return None;
        }
        Some(MarketEvent::Trades {
            exchange,
            pair,
            trades: std::mem::take(&mut self.trades),
        })
    }
}

fn decode_line(batcher: &mut Batcher, n: usize, line: &str) -> Vec<MarketEvent> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<FeedRecord>(line) {
        Ok(FeedRecord::Trade { exchange, pair, trade }) => batcher.push(exchange, pair, trade).into_iter().collect(),
        Ok(FeedRecord::Candle { exchange, candle }) => {
            let mut events: Vec<MarketEvent> = batcher.flush().into_iter().collect();
            events.push(MarketEvent::Candles {
                exchange,
                pair: candle.pair.clone(),
                candles: vec![candle],
            });
            events
        }
        Err(e) => {
            warn!(line = n, error = %e, "Skipping malformed feed line");
            Vec::new()
        }
    }
}

/// Stream a JSON-lines feed file into the advisor. Returns the number of
/// events published.
pub async fn replay(path: impl AsRef<Path>, market: mpsc::Sender<MarketEvent>) -> Result<usize> {
    let path = path.as_ref();
    let file = File::open(path).await?;
    info!(path = %path.display(), "Replaying feed");

    let mut lines = BufReader::new(file).lines();
    let mut batcher = Batcher::default();
    let mut published = 0;
    let mut n = 0;
    while let Some(line) = lines.next_line().await? {
        n += 1;
        for event in decode_line(&mut batcher, n, &line) {
            send(&market, event).await?;
            published += 1;
        }
    }
    if let Some(event) = batcher.flush() {
        send(&market, event).await?;
        published += 1;
    }
    info!(path = %path.display(), lines = n, events = published, "Feed replay finished");
    Ok(published)
}

async fn send(market: &mpsc::Sender<MarketEvent>, event: MarketEvent) -> Result<()> {
    market
        .send(event)
        .await
        .map_err(|_| Error::ChannelClosed("advisor market feed"))
}
