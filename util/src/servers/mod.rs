use glob::glob;
use std::env;
use std::path::Path;

use anyhow::{bail, Context, Result};

use ciborium::value::Value as CborValue;
use serde_yaml::Value;

pub mod configuration;

pub fn settings_for(component: &str) -> Result<config::Config> {
    let conf_d = glob(
        &conf_dir_from_env(&format_conf_dir_env(component))
            .unwrap_or_else(|| format!("/etc/fdo/{}.conf.d/*.yml", component)),
    )?
    .map(|path| {
        let path = path?;
        log::debug!("Loading configuration drop-in {}", path.display());
        Ok(config::File::from(path))
    })
    .collect::<Result<Vec<_>>>()
    .context("Listing configuration files in conf.d")?;

    Ok(config::Config::default()
        .merge(
            config::File::from(Path::new(&format!("/usr/share/fdo/{}.yml", component)))
                .required(false),
        )
        .context("Loading configuration file from /usr/share/fdo")?
        .merge(
            config::File::from(Path::new(
                &conf_dir_from_env(&format_conf_env(component))
                    .unwrap_or_else(|| format!("/etc/fdo/{}.yml", component)),
            ))
            .required(false),
        )
        .context("Loading configuration file from /etc/fdo")?
        .merge(conf_d)
        .context("Loading configuration files from conf.d")?
        .clone())
}

pub fn format_conf_env(component: &str) -> String {
    format!("{}_CONF", component_env_prefix(component))
}

pub fn format_conf_dir_env(component: &str) -> String {
    format!("{}_CONF_DIR", component_env_prefix(component))
}

fn component_env_prefix(component: &str) -> String {
    component.to_string().replace('-', "_").to_uppercase()
}

fn conf_dir_from_env(key: &str) -> Option<String> {
    match env::var_os(key) {
        None => None,
        Some(v) => match v.into_string() {
            Ok(s) => Some(s),
            Err(_) => {
                log::warn!("Ignoring non-UTF-8 value of {}", key);
                None
            }
        },
    }
}

/// Converts a configured YAML value into the CBOR value sent as service info
pub fn yaml_to_cbor(val: &Value) -> Result<CborValue> {
    Ok(match val {
        Value::Null => CborValue::Null,
        Value::Bool(b) => CborValue::Bool(*b),
        Value::Number(nr) => {
            if let Some(nr) = nr.as_u64() {
                CborValue::Integer(nr.into())
            } else if let Some(nr) = nr.as_i64() {
                CborValue::Integer(nr.into())
            } else if let Some(nr) = nr.as_f64() {
                CborValue::Float(nr)
            } else {
                bail!("Invalid number encountered");
            }
        }
        Value::String(str) => CborValue::Text(str.clone()),
        Value::Sequence(seq) => CborValue::Array(
            seq.iter()
                .map(yaml_to_cbor)
                .collect::<Result<Vec<CborValue>>>()?,
        ),
        Value::Mapping(map) => CborValue::Map(
            map.iter()
                .map(|(key, val)| Ok((yaml_to_cbor(key)?, yaml_to_cbor(val)?)))
                .collect::<Result<Vec<_>>>()?,
        ),
        Value::Tagged(tagged) => yaml_to_cbor(&tagged.value)?,
    })
}

#[cfg(test)]
mod test {
    use ciborium::value::Value as CborValue;
    use pretty_assertions::assert_eq;

    use super::{format_conf_dir_env, format_conf_env, yaml_to_cbor};

    #[test]
    fn test_env_names() {
        assert_eq!(
            format_conf_env("rendezvous-server"),
            "RENDEZVOUS_SERVER_CONF"
        );
        assert_eq!(
            format_conf_dir_env("owner-onboarding-server"),
            "OWNER_ONBOARDING_SERVER_CONF_DIR"
        );
    }

    #[test]
    fn test_yaml_to_cbor() {
        let yaml: serde_yaml::Value = serde_yaml::from_str(
            r#"
            name: fdo
            count: 3
            negative: -2
            enabled: true
            list: [1, "two"]
            "#,
        )
        .unwrap();

        assert_eq!(
            yaml_to_cbor(&yaml).unwrap(),
            CborValue::Map(vec![
                (
                    CborValue::Text("name".to_string()),
                    CborValue::Text("fdo".to_string())
                ),
                (CborValue::Text("count".to_string()), CborValue::Integer(3u64.into())),
                (
                    CborValue::Text("negative".to_string()),
                    CborValue::Integer((-2i64).into())
                ),
                (CborValue::Text("enabled".to_string()), CborValue::Bool(true)),
                (
                    CborValue::Text("list".to_string()),
                    CborValue::Array(vec![
                        CborValue::Integer(1u64.into()),
                        CborValue::Text("two".to_string())
                    ])
                ),
            ])
        );
    }
}
