//! Policy lookup tool: a static table of Beijing home-purchase rules.
//!
//! In production this would query a maintained policy knowledge base. The
//! table returns plausible figures so the agent loop can be exercised
//! end-to-end without network access; the numbers are illustrative only.

use async_trait::async_trait;
use anjia_core::error::ToolError;
use anjia_core::schema::{ParamType, ParameterSpec};
use anjia_core::tool::Tool;
use serde::Serialize;
use tracing::debug;

use crate::rates::{self, BuyerType, LoanType};

/// Beijing districts the table knows about.
pub const DISTRICTS: [&str; 16] = [
    "东城", "西城", "朝阳", "海淀", "丰台", "石景山", "通州", "顺义", "昌平", "大兴", "房山",
    "门头沟", "平谷", "怀柔", "密云", "延庆",
];

/// Districts inside the urban core, where second homes carry a higher ratio.
const URBAN_CORE: [&str; 6] = ["东城", "西城", "朝阳", "海淀", "丰台", "石景山"];

pub struct PolicyLookupTool;

#[async_trait]
impl Tool for PolicyLookupTool {
    fn name(&self) -> &str {
        "policy_lookup"
    }

    fn description(&self) -> &str {
        "查询北京购房政策：按区域和购房类型返回首付比例、限购要求、贷款利率和契税税率。"
    }

    fn parameters(&self) -> Vec<ParameterSpec> {
        vec![
            ParameterSpec::required("location", ParamType::String, "购房区域，例如：朝阳、海淀"),
            ParameterSpec::required("buyer_type", ParamType::String, "购房类型")
                .one_of(BuyerType::NAMES),
            ParameterSpec::optional("loan_type", ParamType::String, "贷款方式，默认商贷")
                .one_of(LoanType::NAMES),
        ]
    }

    async fn invoke(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let location = arguments["location"].as_str().unwrap_or_default();
        let district = normalize_district(location).ok_or_else(|| ToolError::ExecutionFailed {
            tool_name: self.name().into(),
            reason: format!("未知区域 '{location}'，支持：{}", DISTRICTS.join("、")),
        })?;

        let buyer = BuyerType::parse(arguments["buyer_type"].as_str().unwrap_or_default())
            .ok_or_else(|| invalid(self.name(), "buyer_type"))?;
        let loan = match arguments["loan_type"].as_str() {
            Some(s) => LoanType::parse(s).ok_or_else(|| invalid(self.name(), "loan_type"))?,
            None => LoanType::Commercial,
        };

        debug!(district, buyer = buyer.name(), loan = loan.name(), "Looking up policy");
        let policy = lookup(district, buyer, loan);
        serde_json::to_value(policy).map_err(|e| ToolError::ExecutionFailed {
            tool_name: self.name().into(),
            reason: e.to_string(),
        })
    }
}

fn invalid(tool: &str, field: &str) -> ToolError {
    ToolError::InvalidArguments {
        tool_name: tool.into(),
        reason: format!("unsupported {field}"),
    }
}

/// Accept both "朝阳" and "朝阳区".
fn normalize_district(location: &str) -> Option<&'static str> {
    let trimmed = location.trim();
    let bare = trimmed.strip_suffix('区').unwrap_or(trimmed);
    DISTRICTS.iter().copied().find(|d| *d == bare)
}

#[derive(Debug, Serialize)]
pub struct Policy {
    pub location: String,
    pub buyer_type: String,
    pub loan_type: String,
    /// Minimum down payment as a fraction of the price
    pub down_payment_ratio: f64,
    pub down_payment_display: String,
    pub purchase_restriction: String,
    pub loan_rate: f64,
    pub loan_rate_display: String,
    pub max_loan_years: u32,
    pub deed_tax_rate: f64,
}

/// Look up the policy for one district, buyer type and loan type.
pub fn lookup(district: &str, buyer: BuyerType, loan: LoanType) -> Policy {
    let ratio = rates::down_payment_ratio(buyer, URBAN_CORE.contains(&district));
    let rate = rates::annual_rate(buyer, loan);

    let restriction = match buyer {
        BuyerType::First => "京籍家庭限购2套，非京籍需连续缴纳社保或个税满5年，限购1套",
        BuyerType::Second => "须名下在京仅有1套住房，非京籍家庭不得购买第二套",
    };

    Policy {
        location: district.to_string(),
        buyer_type: buyer.name().to_string(),
        loan_type: loan.name().to_string(),
        down_payment_ratio: ratio,
        down_payment_display: format!("{:.0}%", ratio * 100.0),
        purchase_restriction: restriction.to_string(),
        loan_rate: rate,
        loan_rate_display: format!("{:.2}%", rate * 100.0),
        max_loan_years: 30,
        deed_tax_rate: rates::deed_tax_rate(buyer),
    }
}
