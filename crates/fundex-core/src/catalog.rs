//! Closed set of recognized security attributes and their storage shape.

use rust_decimal::Decimal;

/// Storage shape of a catalog column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text { max_chars: usize },
    Decimal { precision: u32, scale: u32 },
    Integer,
    Boolean,
    Timestamp,
    Json,
}

/// Per-share prices, EPS and other currency amounts quoted per unit.
pub const PRICE: FieldKind = FieldKind::Decimal {
    precision: 14,
    scale: 4,
};

/// Multiples, margins, yields and growth rates.
pub const RATIO: FieldKind = FieldKind::Decimal {
    precision: 18,
    scale: 6,
};

impl FieldKind {
    /// Postgres column type used by the migrations for this kind.
    pub fn sql_type(&self) -> String {
        match self {
            FieldKind::Text { max_chars } => format!("VARCHAR({max_chars})"),
            FieldKind::Decimal { precision, scale } => format!("NUMERIC({precision},{scale})"),
            FieldKind::Integer => "BIGINT".to_string(),
            FieldKind::Boolean => "BOOLEAN".to_string(),
            FieldKind::Timestamp => "TIMESTAMPTZ".to_string(),
            FieldKind::Json => "JSONB".to_string(),
        }
    }
}

/// Largest magnitude a `NUMERIC(precision, scale)` column accepts, i.e. `10^(p-s) - 10^-s`.
pub fn decimal_max_magnitude(precision: u32, scale: u32) -> Decimal {
    let precision = precision.min(28);
    let digits = 10i128.pow(precision) - 1;
    Decimal::from_i128_with_scale(digits, scale.min(precision))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub column: &'static str,
    /// Attribute names the market-data API uses for this column.
    pub aliases: &'static [&'static str],
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn matches(&self, key: &str) -> bool {
        self.column == key || self.aliases.contains(&key)
    }
}

const fn field(column: &'static str, aliases: &'static [&'static str], kind: FieldKind) -> FieldSpec {
    FieldSpec {
        column,
        aliases,
        kind,
    }
}

const fn text(column: &'static str, aliases: &'static [&'static str], max_chars: usize) -> FieldSpec {
    field(column, aliases, FieldKind::Text { max_chars })
}

/// Attribute key carrying the symbol the remote service answered for.
pub const SYMBOL_KEY: &str = "symbol";

pub static FIELDS: &[FieldSpec] = &[
    // profile
    text("long_name", &["longName"], 255),
    text("short_name", &["shortName"], 128),
    text("sector", &[], 64),
    text("industry", &[], 128),
    text("country", &[], 64),
    text("website", &[], 255),
    text("business_summary", &["longBusinessSummary"], 4000),
    text("currency", &[], 16),
    text("financial_currency", &["financialCurrency"], 16),
    text("exchange", &[], 16),
    text("quote_type", &["quoteType"], 32),
    text("recommendation_key", &["recommendationKey"], 32),
    text("last_split_factor", &["lastSplitFactor"], 16),
    field("full_time_employees", &["fullTimeEmployees"], FieldKind::Integer),
    // share counts, volumes and absolute amounts
    field("market_cap", &["marketCap"], FieldKind::Integer),
    field("enterprise_value", &["enterpriseValue"], FieldKind::Integer),
    field("float_shares", &["floatShares"], FieldKind::Integer),
    field("shares_outstanding", &["sharesOutstanding"], FieldKind::Integer),
    field("shares_short", &["sharesShort"], FieldKind::Integer),
    field(
        "shares_short_prior_month",
        &["sharesShortPriorMonth"],
        FieldKind::Integer,
    ),
    field("volume", &["regularMarketVolume"], FieldKind::Integer),
    field(
        "average_volume",
        &["averageVolume", "averageDailyVolume3Month"],
        FieldKind::Integer,
    ),
    field(
        "average_volume_10days",
        &["averageVolume10days", "averageDailyVolume10Day"],
        FieldKind::Integer,
    ),
    field("bid_size", &["bidSize"], FieldKind::Integer),
    field("ask_size", &["askSize"], FieldKind::Integer),
    field(
        "number_of_analyst_opinions",
        &["numberOfAnalystOpinions"],
        FieldKind::Integer,
    ),
    field("total_cash", &["totalCash"], FieldKind::Integer),
    field("total_debt", &["totalDebt"], FieldKind::Integer),
    field("total_revenue", &["totalRevenue"], FieldKind::Integer),
    field("gross_profits", &["grossProfits"], FieldKind::Integer),
    field("ebitda", &[], FieldKind::Integer),
    field("free_cashflow", &["freeCashflow"], FieldKind::Integer),
    field("operating_cashflow", &["operatingCashflow"], FieldKind::Integer),
    field("net_income_to_common", &["netIncomeToCommon"], FieldKind::Integer),
    // prices
    field("current_price", &["currentPrice", "regularMarketPrice"], PRICE),
    field(
        "previous_close",
        &["previousClose", "regularMarketPreviousClose"],
        PRICE,
    ),
    field("open", &["regularMarketOpen"], PRICE),
    field("day_low", &["dayLow", "regularMarketDayLow"], PRICE),
    field("day_high", &["dayHigh", "regularMarketDayHigh"], PRICE),
    field("fifty_two_week_low", &["fiftyTwoWeekLow"], PRICE),
    field("fifty_two_week_high", &["fiftyTwoWeekHigh"], PRICE),
    field("fifty_day_average", &["fiftyDayAverage"], PRICE),
    field("two_hundred_day_average", &["twoHundredDayAverage"], PRICE),
    field("bid", &[], PRICE),
    field("ask", &[], PRICE),
    field("target_low_price", &["targetLowPrice"], PRICE),
    field("target_mean_price", &["targetMeanPrice"], PRICE),
    field("target_median_price", &["targetMedianPrice"], PRICE),
    field("target_high_price", &["targetHighPrice"], PRICE),
    field("book_value", &["bookValue"], PRICE),
    field("trailing_eps", &["trailingEps", "epsTrailingTwelveMonths"], PRICE),
    field("forward_eps", &["forwardEps", "epsForward"], PRICE),
    field("dividend_rate", &["dividendRate"], PRICE),
    field(
        "trailing_annual_dividend_rate",
        &["trailingAnnualDividendRate"],
        PRICE,
    ),
    field("revenue_per_share", &["revenuePerShare"], PRICE),
    field("total_cash_per_share", &["totalCashPerShare"], PRICE),
    // ratios
    field("trailing_pe", &["trailingPE"], RATIO),
    field("forward_pe", &["forwardPE"], RATIO),
    field("peg_ratio", &["pegRatio", "trailingPegRatio"], RATIO),
    field("price_to_book", &["priceToBook"], RATIO),
    field(
        "price_to_sales_trailing_12_months",
        &["priceToSalesTrailing12Months"],
        RATIO,
    ),
    field("enterprise_to_revenue", &["enterpriseToRevenue"], RATIO),
    field("enterprise_to_ebitda", &["enterpriseToEbitda"], RATIO),
    field("debt_to_equity", &["debtToEquity"], RATIO),
    field("return_on_equity", &["returnOnEquity"], RATIO),
    field("return_on_assets", &["returnOnAssets"], RATIO),
    field("dividend_yield", &["dividendYield"], RATIO),
    field(
        "trailing_annual_dividend_yield",
        &["trailingAnnualDividendYield"],
        RATIO,
    ),
    field(
        "five_year_avg_dividend_yield",
        &["fiveYearAvgDividendYield"],
        RATIO,
    ),
    field("payout_ratio", &["payoutRatio"], RATIO),
    field("revenue_growth", &["revenueGrowth"], RATIO),
    field("earnings_growth", &["earningsGrowth"], RATIO),
    field(
        "earnings_quarterly_growth",
        &["earningsQuarterlyGrowth"],
        RATIO,
    ),
    field("gross_margins", &["grossMargins"], RATIO),
    field("profit_margins", &["profitMargins"], RATIO),
    field("operating_margins", &["operatingMargins"], RATIO),
    field("ebitda_margins", &["ebitdaMargins"], RATIO),
    field("current_ratio", &["currentRatio"], RATIO),
    field("quick_ratio", &["quickRatio"], RATIO),
    field("beta", &[], RATIO),
    field("short_ratio", &["shortRatio"], RATIO),
    field("short_percent_of_float", &["shortPercentOfFloat"], RATIO),
    field("held_percent_insiders", &["heldPercentInsiders"], RATIO),
    field(
        "held_percent_institutions",
        &["heldPercentInstitutions"],
        RATIO,
    ),
    // dates (epoch seconds on the wire)
    field("regular_market_time", &["regularMarketTime"], FieldKind::Timestamp),
    field("ex_dividend_date", &["exDividendDate"], FieldKind::Timestamp),
    field("dividend_date", &["dividendDate"], FieldKind::Timestamp),
    field("last_split_date", &["lastSplitDate"], FieldKind::Timestamp),
    field("last_fiscal_year_end", &["lastFiscalYearEnd"], FieldKind::Timestamp),
    field("most_recent_quarter", &["mostRecentQuarter"], FieldKind::Timestamp),
    field("date_short_interest", &["dateShortInterest"], FieldKind::Timestamp),
    // flags
    field("tradeable", &[], FieldKind::Boolean),
    field("triggerable", &[], FieldKind::Boolean),
    field("esg_populated", &["esgPopulated"], FieldKind::Boolean),
    field("crypto_tradeable", &["cryptoTradeable"], FieldKind::Boolean),
    // structured blobs
    field("company_officers", &["companyOfficers"], FieldKind::Json),
    field("corporate_actions", &["corporateActions"], FieldKind::Json),
];

/// Resolves an attribute name (storage column or API alias) to its catalog entry.
pub fn field_for_key(key: &str) -> Option<&'static FieldSpec> {
    FIELDS.iter().find(|spec| spec.matches(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashSet;

    #[test]
    fn columns_and_aliases_are_unique() {
        let mut seen = HashSet::new();
        for spec in FIELDS {
            assert!(seen.insert(spec.column), "duplicate column {}", spec.column);
            for alias in spec.aliases {
                assert!(seen.insert(*alias), "duplicate alias {alias}");
            }
        }
        assert!(!seen.contains(SYMBOL_KEY));
    }

    #[test]
    fn lookup_accepts_column_and_api_names() {
        assert_eq!(field_for_key("trailingPE").map(|f| f.column), Some("trailing_pe"));
        assert_eq!(field_for_key("trailing_pe").map(|f| f.column), Some("trailing_pe"));
        assert_eq!(
            field_for_key("regularMarketPrice").map(|f| f.column),
            Some("current_price")
        );
        assert!(field_for_key("maxAge").is_none());
    }

    #[test]
    fn decimal_bounds_follow_precision_and_scale() {
        assert_eq!(decimal_max_magnitude(10, 2), dec!(99999999.99));
        assert_eq!(decimal_max_magnitude(14, 4), dec!(9999999999.9999));
        assert_eq!(PRICE.sql_type(), "NUMERIC(14,4)");
    }
}
