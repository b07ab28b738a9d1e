//! Configuration validation

use super::{parse_cidr, Config};

/// Collected diagnostics from a validation pass
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            eprintln!("[WARN] {}", warning);
        }
        for error in &self.errors {
            eprintln!("[ERROR] {}", error);
        }
    }
}

/// Validate a parsed configuration
pub fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::default();

    if config.interfaces.is_empty() {
        result.errors.push("no interfaces configured".to_string());
    }

    for (name, iface) in &config.interfaces {
        match &iface.address {
            Some(address) if parse_cidr(address).is_none() => {
                result
                    .errors
                    .push(format!("interface {}: invalid address {:?}", name, address));
            }
            Some(_) => {}
            None => {
                result
                    .warnings
                    .push(format!("interface {} has no address", name));
            }
        }
    }

    for route in &config.routing.static_routes {
        if parse_cidr(&route.destination).is_none() {
            result.errors.push(format!(
                "route: invalid destination {:?}",
                route.destination
            ));
        }
        if route.gateway.parse::<std::net::Ipv4Addr>().is_err() {
            result
                .errors
                .push(format!("route: invalid gateway {:?}", route.gateway));
        }
    }

    if let Some(nat) = &config.nat {
        if nat.enabled {
            for name in [&nat.inside, &nat.outside] {
                match config.interfaces.get(name) {
                    None => {
                        result
                            .errors
                            .push(format!("nat: unknown interface {:?}", name));
                    }
                    Some(iface) if iface.address.is_none() => {
                        result
                            .errors
                            .push(format!("nat: interface {} has no address", name));
                    }
                    Some(_) => {}
                }
            }
            if nat.inside == nat.outside {
                result
                    .errors
                    .push("nat: inside and outside are the same interface".to_string());
            }
        }
    }

    result
}
