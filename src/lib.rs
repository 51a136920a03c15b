use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Error};
use calamine::{open_workbook, Data, DataType, Reader, Xlsx};
use log::warn;
use rust_decimal::Decimal;
use time::{format_description::BorrowedFormatItem, macros::format_description, Date};

pub type Result<T> = std::result::Result<T, Error>;

const LEDGER_CURRENCY: &str = "CAD";
const MARKET_SUFFIX: &str = ".TO";
const PRICE_TIMEOUT: Duration = Duration::from_secs(10);

static EXPORT_DATE_FMT: &[BorrowedFormatItem] = format_description!("[day]/[month]/[year]");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeKind {
    Buy,
    Sell,
}

impl TradeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "Buy",
            Self::Sell => "Sell",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub symbol: String,
    pub kind: Option<TradeKind>,
    pub date: Date,
    pub shares: Decimal,
    pub price: Option<Decimal>,
    pub commission: Decimal,
}

/// Column indices recovered from the export's header row. The account,
/// activity, action and currency columns only drive filtering and never
/// reach the output ledger.
#[derive(Debug)]
pub struct ColumnMap {
    date: usize,
    symbol: usize,
    shares: usize,
    price: usize,
    commission: usize,
    account: usize,
    activity: usize,
    action: usize,
    currency: usize,
}

impl ColumnMap {
    pub fn from_headers(headers: &[String]) -> Result<Self> {
        let mut date: Option<usize> = None;
        let mut symbol: Option<usize> = None;
        let mut shares: Option<usize> = None;
        let mut price: Option<usize> = None;
        let mut commission: Option<usize> = None;
        let mut account: Option<usize> = None;
        let mut activity: Option<usize> = None;
        let mut action: Option<usize> = None;
        let mut currency: Option<usize> = None;
        headers
            .iter()
            .enumerate()
            .for_each(|(pos, h)| match h.trim() {
                "TransactionDate" => date = Some(pos),
                "Symbol" => symbol = Some(pos),
                "Quantity" => shares = Some(pos),
                "Price" => price = Some(pos),
                "Commission" => commission = Some(pos),
                "AccountNumber" => account = Some(pos),
                "ActivityType" => activity = Some(pos),
                "Action" => action = Some(pos),
                "CurrencyDisplay" => currency = Some(pos),
                _ => {}
            });
        Ok(Self {
            date: date.context("export is missing the TransactionDate column")?,
            symbol: symbol.context("export is missing the Symbol column")?,
            shares: shares.context("export is missing the Quantity column")?,
            price: price.context("export is missing the Price column")?,
            commission: commission.context("export is missing the Commission column")?,
            account: account.context("export is missing the AccountNumber column")?,
            activity: activity.context("export is missing the ActivityType column")?,
            action: action.context("export is missing the Action column")?,
            currency: currency.context("export is missing the CurrencyDisplay column")?,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PriceError {
    #[error("no trading data for {symbol} on {date}")]
    NoData { symbol: String, date: Date },
    #[error("price request failed")]
    Http(#[from] reqwest::Error),
    #[error("malformed price data")]
    Malformed(#[from] csv::Error),
    #[error("price data has no Close column")]
    MissingCloseColumn,
    #[error("unparseable close price {value:?} for {symbol}")]
    BadClose { symbol: String, value: String },
}

pub trait PriceSource {
    /// Closing price for the bare ticker on the given calendar day.
    fn close_on_day(&self, symbol: &str, date: Date) -> std::result::Result<Decimal, PriceError>;
}

pub struct YahooClient {
    http: reqwest::blocking::Client,
}

impl YahooClient {
    pub fn new() -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(PRICE_TIMEOUT)
            .build()?;
        Ok(Self { http })
    }
}

impl PriceSource for YahooClient {
    fn close_on_day(&self, symbol: &str, date: Date) -> std::result::Result<Decimal, PriceError> {
        let start = date.midnight().assume_utc().unix_timestamp();
        let end = start + 86_400;
        let r = self.http
            .get(format!(
                "https://query1.finance.yahoo.com/v7/finance/download/{}{}?period1={}&period2={}&interval=1d&events=history",
                symbol, MARKET_SUFFIX, start, end))
            .send()?;
        if r.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PriceError::NoData {
                symbol: symbol.to_string(),
                date,
            });
        }
        let mut rdr = csv::Reader::from_reader(r.error_for_status()?);
        let close_index = rdr
            .headers()?
            .iter()
            .position(|h| h.trim() == "Close")
            .ok_or(PriceError::MissingCloseColumn)?;
        let Some(record) = rdr.records().next() else {
            return Err(PriceError::NoData {
                symbol: symbol.to_string(),
                date,
            });
        };
        let record = record?;
        let close = record[close_index].trim();
        // Yahoo emits "null" for days the market was closed
        if close.is_empty() || close == "null" {
            return Err(PriceError::NoData {
                symbol: symbol.to_string(),
                date,
            });
        }
        close.parse::<Decimal>().map_err(|_| PriceError::BadClose {
            symbol: symbol.to_string(),
            value: close.to_string(),
        })
    }
}

fn cell_decimal(cell: &Data) -> Result<Decimal> {
    match cell {
        Data::Int(i) => Ok(Decimal::from(*i)),
        Data::Float(f) => Decimal::try_from(*f).context("number cell out of decimal range"),
        Data::String(s) => s
            .trim()
            .parse()
            .with_context(|| format!("not a valid number: {s:?}")),
        other => bail!("expected a numeric cell, found {other:?}"),
    }
}

fn column_price(row: &[Data], cols: &ColumnMap) -> Result<Option<Decimal>> {
    match &row[cols.price] {
        Data::Empty => Ok(None),
        cell => cell_decimal(cell).map(Some).context("bad Price cell"),
    }
}

pub fn classify_row(
    row: &[Data],
    cols: &ColumnMap,
    account: &str,
    prices: &dyn PriceSource,
) -> Result<Option<Transaction>> {
    // only process CAD rows, and only for the requested account
    if row[cols.currency].as_string().as_deref() != Some(LEDGER_CURRENCY) {
        return Ok(None);
    }
    if row[cols.account].as_string().as_deref() != Some(account) {
        return Ok(None);
    }

    // rows without a symbol are cash movements, not security trades
    let raw_symbol = row[cols.symbol].as_string().unwrap_or_default();
    if raw_symbol.is_empty() {
        return Ok(None);
    }
    let symbol = raw_symbol
        .strip_suffix(MARKET_SUFFIX)
        .unwrap_or(&raw_symbol)
        .to_string();

    let raw_date = row[cols.date]
        .as_string()
        .context("missing transaction date")?;
    let date = Date::parse(&raw_date, &EXPORT_DATE_FMT)
        .with_context(|| format!("malformed transaction date {raw_date:?}"))?;

    let action = row[cols.action].as_string().unwrap_or_default();
    let activity = row[cols.activity].as_string().unwrap_or_default();

    let kind_from_action = match action.as_str() {
        "Buy" => Some(TradeKind::Buy),
        "Sell" => Some(TradeKind::Sell),
        _ => None,
    };
    let (kind, price) = if let Some(kind) = kind_from_action {
        (Some(kind), column_price(row, cols)?)
    } else {
        match activity.as_str() {
            // deposits and withdrawals of securities are implied trades,
            // priced at that day's close
            "Withdrawals" | "Deposits" => {
                let kind = if activity == "Withdrawals" {
                    TradeKind::Sell
                } else {
                    TradeKind::Buy
                };
                match prices.close_on_day(&symbol, date) {
                    Ok(close) => (Some(kind), Some(close)),
                    Err(PriceError::NoData { symbol, date }) => {
                        warn!("no trading data for {symbol} on {date}, skipping row");
                        return Ok(None);
                    }
                    Err(e) => {
                        return Err(Error::new(e)
                            .context(format!("price lookup failed for {symbol}")))
                    }
                }
            }
            "Dividends" => return Ok(None),
            _ => (None, column_price(row, cols)?),
        }
    };

    // the export encodes sells and fees as negative numbers
    let shares = cell_decimal(&row[cols.shares])
        .context("bad Quantity cell")?
        .abs();
    let commission = cell_decimal(&row[cols.commission])
        .context("bad Commission cell")?
        .abs();

    Ok(Some(Transaction {
        symbol,
        kind,
        date,
        shares,
        price,
        commission,
    }))
}

pub fn extract_transactions<P: AsRef<Path>>(
    file_path: P,
    account: &str,
    prices: &dyn PriceSource,
) -> Result<Vec<Transaction>> {
    let mut spreadsheet: Xlsx<_> = open_workbook(file_path)?;
    let range = spreadsheet
        .worksheet_range_at(0)
        .context("workbook has no sheets")??;
    let headers = range.headers().context("failed to extract headers")?;
    let cols = ColumnMap::from_headers(&headers)?;

    let mut transactions = Vec::new();
    for r in range.rows().skip(1) {
        if let Some(t) = classify_row(r, &cols, account, prices)? {
            transactions.push(t);
        }
    }
    Ok(transactions)
}

fn ledger_date(date: Date) -> String {
    // the ledger format is not zero-padded, e.g. 2014-2-1
    format!(
        "{}-{}-{}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

pub fn write_ledger<P: AsRef<Path>>(transactions: &[Transaction], file_path: P) -> Result<()> {
    let mut wtr = csv::Writer::from_path(&file_path)?;
    wtr.write_record(["Symbol", "Type", "Date", "Shares", "Price", "Commission"])?;
    for t in transactions {
        wtr.write_record(&[
            t.symbol.clone(),
            t.kind.map(|k| k.as_str().to_string()).unwrap_or_default(),
            ledger_date(t.date),
            t.shares.to_string(),
            t.price.map(|p| p.to_string()).unwrap_or_default(),
            t.commission.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}
