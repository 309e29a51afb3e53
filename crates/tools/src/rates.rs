//! Shared buyer/loan classifications and the illustrative rate table.

/// First or second home purchase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuyerType {
    First,
    Second,
}

impl BuyerType {
    pub const NAMES: [&'static str; 2] = ["首套", "二套"];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "首套" => Some(Self::First),
            "二套" => Some(Self::Second),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::First => "首套",
            Self::Second => "二套",
        }
    }
}

/// How the loan part of the price is financed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoanType {
    Commercial,
    ProvidentFund,
    /// Provident fund up to its cap, commercial for the rest
    Combination,
}

impl LoanType {
    pub const NAMES: [&'static str; 3] = ["商贷", "公积金", "组合贷"];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "商贷" => Some(Self::Commercial),
            "公积金" => Some(Self::ProvidentFund),
            "组合贷" => Some(Self::Combination),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Commercial => "商贷",
            Self::ProvidentFund => "公积金",
            Self::Combination => "组合贷",
        }
    }
}

/// Provident fund loans are capped per household (in yuan).
pub const PROVIDENT_FUND_CAP: f64 = 1_200_000.0;

const COMMERCIAL_FIRST: f64 = 0.0365;
const COMMERCIAL_SECOND: f64 = 0.0435;
const FUND_FIRST: f64 = 0.0310;
const FUND_SECOND: f64 = 0.0355;

pub fn commercial_rate(buyer: BuyerType) -> f64 {
    match buyer {
        BuyerType::First => COMMERCIAL_FIRST,
        BuyerType::Second => COMMERCIAL_SECOND,
    }
}

pub fn fund_rate(buyer: BuyerType) -> f64 {
    match buyer {
        BuyerType::First => FUND_FIRST,
        BuyerType::Second => FUND_SECOND,
    }
}

/// Headline annual rate. Combination loans quote the commercial rate.
pub fn annual_rate(buyer: BuyerType, loan: LoanType) -> f64 {
    match loan {
        LoanType::ProvidentFund => fund_rate(buyer),
        LoanType::Commercial | LoanType::Combination => commercial_rate(buyer),
    }
}

/// Minimum down payment as a fraction of the price.
pub fn down_payment_ratio(buyer: BuyerType, urban_core: bool) -> f64 {
    match buyer {
        BuyerType::First => 0.30,
        BuyerType::Second if urban_core => 0.40,
        BuyerType::Second => 0.35,
    }
}

pub fn deed_tax_rate(buyer: BuyerType) -> f64 {
    match buyer {
        BuyerType::First => 0.01,
        BuyerType::Second => 0.02,
    }
}

/// Equal principal-and-interest monthly payment.
///
/// `M = P * r * (1+r)^n / ((1+r)^n - 1)` with monthly rate `r` over `n`
/// months; a zero rate degenerates to `P / n`.
pub fn monthly_payment(principal: f64, annual_rate: f64, years: u32) -> f64 {
    let months = years * 12;
    if principal <= 0.0 || months == 0 {
        return 0.0;
    }
    let r = annual_rate / 12.0;
    if r == 0.0 {
        return principal / months as f64;
    }
    let growth = (1.0 + r).powi(months as i32);
    principal * r * growth / (growth - 1.0)
}
