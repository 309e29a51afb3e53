//! Cost calculator tool: down payment, loan split, monthly payment, deed tax.
//!
//! Uses the same illustrative rate table as `policy_lookup`. The second-home
//! ratio assumes the urban core (the conservative figure).

use async_trait::async_trait;
use anjia_core::error::ToolError;
use anjia_core::schema::{ParamType, ParameterSpec};
use anjia_core::tool::Tool;
use serde::Serialize;
use tracing::debug;

use crate::rates::{self, BuyerType, LoanType, PROVIDENT_FUND_CAP};

const DEFAULT_LOAN_YEARS: u32 = 30;
const MAX_LOAN_YEARS: u32 = 30;

pub struct CostCalculatorTool;

#[async_trait]
impl Tool for CostCalculatorTool {
    fn name(&self) -> &str {
        "cost_calculator"
    }

    fn description(&self) -> &str {
        "测算购房资金：根据总价（元）、购房类型、贷款年限和贷款方式计算首付、贷款额、月供、总利息和契税。"
    }

    fn parameters(&self) -> Vec<ParameterSpec> {
        vec![
            ParameterSpec::required("total_price", ParamType::Number, "房屋总价（元）"),
            ParameterSpec::required("buyer_type", ParamType::String, "购房类型")
                .one_of(BuyerType::NAMES),
            ParameterSpec::optional("loan_years", ParamType::Integer, "贷款年限，1-30，默认30"),
            ParameterSpec::optional("loan_type", ParamType::String, "贷款方式，默认商贷")
                .one_of(LoanType::NAMES),
        ]
    }

    async fn invoke(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let total_price = arguments["total_price"].as_f64().unwrap_or_default();
        if !total_price.is_finite() || total_price <= 0.0 {
            return Err(self.invalid("total_price must be a positive amount"));
        }

        let buyer = BuyerType::parse(arguments["buyer_type"].as_str().unwrap_or_default())
            .ok_or_else(|| self.invalid("unsupported buyer_type"))?;

        let loan_years = match arguments["loan_years"].as_f64() {
            Some(y) if (1.0..=MAX_LOAN_YEARS as f64).contains(&y) => y as u32,
            Some(_) => return Err(self.invalid("loan_years must be between 1 and 30")),
            None => DEFAULT_LOAN_YEARS,
        };

        let loan = match arguments["loan_type"].as_str() {
            Some(s) => LoanType::parse(s).ok_or_else(|| self.invalid("unsupported loan_type"))?,
            None => LoanType::Commercial,
        };

        debug!(total_price, loan_years, loan = loan.name(), "Calculating purchase costs");
        let breakdown = calculate(total_price, buyer, loan_years, loan);
        serde_json::to_value(breakdown).map_err(|e| ToolError::ExecutionFailed {
            tool_name: self.name().into(),
            reason: e.to_string(),
        })
    }
}

impl CostCalculatorTool {
    fn invalid(&self, reason: &str) -> ToolError {
        ToolError::InvalidArguments {
            tool_name: self.name().into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CostBreakdown {
    pub total_price: f64,
    pub buyer_type: String,
    pub loan_type: String,
    pub loan_years: u32,
    pub down_payment_ratio: f64,
    pub down_payment: f64,
    pub loan_amount: f64,
    pub commercial_loan: f64,
    pub provident_fund_loan: f64,
    pub monthly_payment: f64,
    pub total_interest: f64,
    pub deed_tax: f64,
    /// Down payment plus deed tax
    pub upfront_cash: f64,
}

/// Compute the full breakdown. Amounts are rounded to whole yuan.
pub fn calculate(total_price: f64, buyer: BuyerType, years: u32, loan: LoanType) -> CostBreakdown {
    let ratio = rates::down_payment_ratio(buyer, true);
    let down_payment = total_price * ratio;
    let loan_amount = total_price - down_payment;

    let (commercial, fund) = match loan {
        LoanType::Commercial => (loan_amount, 0.0),
        LoanType::ProvidentFund => (0.0, loan_amount),
        LoanType::Combination => {
            let fund = loan_amount.min(PROVIDENT_FUND_CAP);
            (loan_amount - fund, fund)
        }
    };

    let monthly = rates::monthly_payment(commercial, rates::commercial_rate(buyer), years)
        + rates::monthly_payment(fund, rates::fund_rate(buyer), years);
    let total_interest = monthly * (years * 12) as f64 - loan_amount;
    let deed_tax = total_price * rates::deed_tax_rate(buyer);

    CostBreakdown {
        total_price: total_price.round(),
        buyer_type: buyer.name().to_string(),
        loan_type: loan.name().to_string(),
        loan_years: years,
        down_payment_ratio: ratio,
        down_payment: down_payment.round(),
        loan_amount: loan_amount.round(),
        commercial_loan: commercial.round(),
        provident_fund_loan: fund.round(),
        monthly_payment: monthly.round(),
        total_interest: total_interest.max(0.0).round(),
        deed_tax: deed_tax.round(),
        upfront_cash: (down_payment + deed_tax).round(),
    }
}
