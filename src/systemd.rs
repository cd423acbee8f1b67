use std::collections::BTreeMap;

use serde::Serialize;

use crate::{
    context::Context,
    convergence::{Check, CheckFailure, require},
    transport::{Command, Transport, TransportError, shell_quote},
};

/// Output of `systemctl show <unit>`, keyed by property name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct UnitProperties(BTreeMap<String, String>);

impl UnitProperties {
    /// Parses `Key=Value` lines. Values may themselves contain `=`; lines
    /// without one are ignored.
    pub fn parse(output: &str) -> Self {
        let props = output
            .lines()
            .filter_map(|line| line.split_once('='))
            .filter(|(key, _)| !key.trim().is_empty())
            .map(|(key, value)| (key.trim().to_string(), value.to_string()))
            .collect();
        Self(props)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn load_state(&self) -> Option<&str> {
        self.get("LoadState")
    }

    pub fn active_state(&self) -> Option<&str> {
        self.get("ActiveState")
    }

    pub fn sub_state(&self) -> Option<&str> {
        self.get("SubState")
    }

    pub fn is_active(&self) -> bool {
        self.active_state() == Some("active")
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

pub async fn fetch_unit_properties(
    ctx: &Context,
    transport: &dyn Transport,
    unit: &str,
) -> Result<UnitProperties, TransportError> {
    let cmd = Command::new(format!("systemctl show {} --no-pager", shell_quote(unit)));
    let out = transport.run(ctx, &cmd).await?;
    Ok(UnitProperties::parse(&out.stdout))
}

/// Passes once the unit selected by `props` reports `ActiveState=active`.
pub fn unit_is_active<S: 'static>(
    props: impl Fn(&S) -> Option<&UnitProperties> + Send + Sync + 'static,
) -> Check<S> {
    Check::new("unit_is_active", move |s: &S| {
        let props = require(props(s), "unit properties")?;
        if props.is_active() {
            Ok(())
        } else {
            Err(CheckFailure::new(format!(
                "unit is {} ({})",
                props.active_state().unwrap_or("unknown"),
                props.sub_state().unwrap_or("unknown")
            )))
        }
    })
}
