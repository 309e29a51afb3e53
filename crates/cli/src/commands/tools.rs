//! `anjia tools`: list the built-in tools.

use std::time::Duration;

use anjia_core::tool::ToolDescriptor;

pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    let registry = anjia_tools::default_registry(Duration::from_secs(30));

    println!("🔧 {} built-in tools", registry.len());
    for descriptor in registry.descriptors() {
        println!();
        println!("{}", format_tool(&descriptor));
    }
    Ok(())
}

fn format_tool(descriptor: &ToolDescriptor) -> String {
    let mut out = format!("  {}\n    {}", descriptor.name, descriptor.description);
    for p in &descriptor.parameters {
        let marker = if p.required { "*" } else { " " };
        out.push_str(&format!("\n    {marker} {:<12} {:<8} {}", p.name, p.kind.as_str(), p.description));
        if !p.allowed.is_empty() {
            out.push_str(&format!(" [{}]", p.allowed.join("|")));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_required_and_enum_parameters() {
        let registry = anjia_tools::default_registry(Duration::from_secs(30));
        let descriptor = registry
            .descriptors()
            .into_iter()
            .find(|d| d.name == "policy_lookup")
            .unwrap();

        let text = format_tool(&descriptor);
        assert!(text.starts_with("  policy_lookup"));
        assert!(text.contains("* location"));
        assert!(text.contains("[首套|二套]"));
    }
}
