use std::collections::HashSet;

use ciborium::value::Value;

use crate::{
    constants::{DevmodSim, MANDATORY_DEVMOD_SIMS},
    errors::Result,
    types::{ServiceInfo, ServiceInfoKV},
    Error, Serializable,
};

/// The `devmod` module every device reports before receiving owner service info
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Devmod {
    pub os: String,
    pub arch: String,
    pub version: String,
    pub device: String,
    pub serial_number: Option<String>,
    pub path_separator: Option<String>,
    pub separator: String,
    pub newline: Option<String>,
    pub tmp: Option<String>,
    pub dir: Option<String>,
    pub programming_environment: Option<String>,
    pub bin: String,
    pub mud_url: Option<String>,
    pub modules: Vec<String>,
}

impl Devmod {
    pub fn to_service_info(&self) -> Result<ServiceInfo> {
        let mut out = vec![
            ServiceInfoKV::new_encoded(DevmodSim::Active.key(), &true)?,
            ServiceInfoKV::new_encoded(DevmodSim::Os.key(), &self.os)?,
            ServiceInfoKV::new_encoded(DevmodSim::Arch.key(), &self.arch)?,
            ServiceInfoKV::new_encoded(DevmodSim::Version.key(), &self.version)?,
            ServiceInfoKV::new_encoded(DevmodSim::Device.key(), &self.device)?,
            ServiceInfoKV::new_encoded(DevmodSim::Separator.key(), &self.separator)?,
            ServiceInfoKV::new_encoded(DevmodSim::Bin.key(), &self.bin)?,
        ];

        let optional = [
            (DevmodSim::SerialNumber, &self.serial_number),
            (DevmodSim::PathSeparator, &self.path_separator),
            (DevmodSim::Newline, &self.newline),
            (DevmodSim::Tmp, &self.tmp),
            (DevmodSim::Dir, &self.dir),
            (DevmodSim::ProgrammingEnvironment, &self.programming_environment),
            (DevmodSim::MudUrl, &self.mud_url),
        ];
        for (sim, value) in optional {
            if let Some(value) = value {
                out.push(ServiceInfoKV::new_encoded(sim.key(), value)?);
            }
        }

        out.push(ServiceInfoKV::new_encoded(
            DevmodSim::NumModules.key(),
            &(self.modules.len() as u64),
        )?);

        // [first index, count, names...]
        let mut modules = vec![
            Value::Integer(0.into()),
            Value::Integer((self.modules.len() as u64).into()),
        ];
        modules.extend(self.modules.iter().cloned().map(Value::Text));
        out.push(ServiceInfoKV::new(
            DevmodSim::Modules.key(),
            Value::Array(modules).serialize_data()?,
        ));

        Ok(out)
    }

    /// Collects and type-checks the devmod entries out of everything the
    /// device sent. Entries of other modules are ignored.
    pub fn from_service_info<'a, I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a ServiceInfoKV>,
    {
        let mut seen = HashSet::new();
        let mut builder = DevmodBuilder::default();

        for entry in entries {
            if !entry.key().starts_with("devmod:") {
                continue;
            }
            let sim: DevmodSim = match entry.key().parse() {
                Ok(sim) => sim,
                Err(_) => {
                    log::debug!("Ignoring unknown devmod key {}", entry.key());
                    continue;
                }
            };
            builder.apply(sim, entry)?;
            seen.insert(sim);
        }

        for sim in MANDATORY_DEVMOD_SIMS {
            if !seen.contains(sim) {
                log::error!("Device did not send mandatory {}", sim);
                return Err(Error::InconsistentValue("missing mandatory devmod value"));
            }
        }

        builder.finish()
    }
}

#[derive(Default)]
struct DevmodBuilder {
    active: bool,
    strings: std::collections::HashMap<DevmodSim, String>,
    num_modules: u64,
    modules: Vec<String>,
}

impl DevmodBuilder {
    fn apply(&mut self, sim: DevmodSim, entry: &ServiceInfoKV) -> Result<()> {
        match sim {
            DevmodSim::Active => {
                self.active = entry
                    .decode_value()
                    .map_err(|_| Error::InconsistentValue("devmod:active"))?
            }
            DevmodSim::NumModules => {
                self.num_modules = entry
                    .decode_value()
                    .map_err(|_| Error::InconsistentValue("devmod:nummodules"))?
            }
            DevmodSim::Modules => self.modules.extend(decode_modules(entry.value())?),
            _ => {
                let value: String = entry
                    .decode_value()
                    .map_err(|_| Error::InconsistentValue("devmod string value"))?;
                self.strings.insert(sim, value);
            }
        }
        Ok(())
    }

    fn finish(mut self) -> Result<Devmod> {
        if !self.active {
            return Err(Error::InconsistentValue("devmod:active"));
        }
        if self.num_modules != self.modules.len() as u64 {
            return Err(Error::InconsistentValue("devmod:nummodules"));
        }
        let mut take = |sim| self.strings.remove(&sim);
        let required = |value: Option<String>| {
            value.ok_or(Error::InconsistentValue("missing mandatory devmod value"))
        };

        Ok(Devmod {
            os: required(take(DevmodSim::Os))?,
            arch: required(take(DevmodSim::Arch))?,
            version: required(take(DevmodSim::Version))?,
            device: required(take(DevmodSim::Device))?,
            serial_number: take(DevmodSim::SerialNumber),
            path_separator: take(DevmodSim::PathSeparator),
            separator: required(take(DevmodSim::Separator))?,
            newline: take(DevmodSim::Newline),
            tmp: take(DevmodSim::Tmp),
            dir: take(DevmodSim::Dir),
            programming_environment: take(DevmodSim::ProgrammingEnvironment),
            bin: required(take(DevmodSim::Bin))?,
            mud_url: take(DevmodSim::MudUrl),
            modules: self.modules,
        })
    }
}

fn decode_modules(value: &[u8]) -> Result<Vec<String>> {
    let err = || Error::InconsistentValue("devmod:modules");

    let items = match Value::deserialize_data(value).map_err(|_| err())? {
        Value::Array(items) => items,
        _ => return Err(err()),
    };
    if items.len() < 2 {
        return Err(err());
    }
    let (header, names) = items.split_at(2);
    for num in header {
        if !matches!(num, Value::Integer(_)) {
            return Err(err());
        }
    }
    let count = match &header[1] {
        Value::Integer(count) => u64::try_from(*count).map_err(|_| err())?,
        _ => return Err(err()),
    };
    if count != names.len() as u64 {
        return Err(err());
    }
    names
        .iter()
        .map(|name| match name {
            Value::Text(name) => Ok(name.clone()),
            _ => Err(err()),
        })
        .collect()
}

// Array header and flags around the ServiceInfo of messages 68 and 69
const SERVICE_INFO_MESSAGE_OVERHEAD: usize = 8;

/// Encoded ServiceInfo bytes that fit in a message of `max_message_size`
pub fn service_info_budget(max_message_size: u16) -> usize {
    (max_message_size as usize).saturating_sub(SERVICE_INFO_MESSAGE_OVERHEAD)
}

/// Splits service info into messages whose encoded size fits `max_size`
pub fn split_service_info(entries: &[ServiceInfoKV], max_size: usize) -> Result<Vec<ServiceInfo>> {
    let mut out: Vec<ServiceInfo> = Vec::new();
    let mut current: ServiceInfo = Vec::new();

    for entry in entries {
        current.push(entry.clone());
        if current.serialize_data()?.len() <= max_size {
            continue;
        }
        let entry = current.pop().ok_or(Error::InvalidTransition)?;
        if current.is_empty() {
            return Err(Error::InconsistentValue("service info entry too large"));
        }
        out.push(std::mem::take(&mut current));
        current.push(entry);
        if current.serialize_data()?.len() > max_size {
            return Err(Error::InconsistentValue("service info entry too large"));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }

    Ok(out)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::{split_service_info, Devmod};
    use crate::{types::ServiceInfoKV, Serializable};

    fn devmod() -> Devmod {
        Devmod {
            os: "linux".to_string(),
            arch: "x86_64".to_string(),
            version: "6.1".to_string(),
            device: "fdo-test".to_string(),
            serial_number: Some("SN123".to_string()),
            path_separator: None,
            separator: ":".to_string(),
            newline: None,
            tmp: None,
            dir: None,
            programming_environment: None,
            bin: "x86_64".to_string(),
            mud_url: None,
            modules: vec!["devmod".to_string(), "fdo_sys".to_string()],
        }
    }

    #[test]
    fn test_devmod_round_trip() {
        let encoded = devmod().to_service_info().unwrap();
        assert_eq!(Devmod::from_service_info(&encoded).unwrap(), devmod());
    }

    #[test]
    fn test_devmod_missing_mandatory() {
        let encoded = devmod().to_service_info().unwrap();
        for idx in 0..encoded.len() {
            let key = encoded[idx].key().to_string();
            let mut reduced = encoded.clone();
            reduced.remove(idx);
            let result = Devmod::from_service_info(&reduced);
            if key == "devmod:sn" {
                result.unwrap();
            } else {
                assert!(result.is_err(), "accepted without {}", key);
            }
        }
    }

    #[test]
    fn test_devmod_mistyped() {
        let mut encoded = devmod().to_service_info().unwrap();
        let os = encoded
            .iter_mut()
            .find(|kv| kv.key() == "devmod:os")
            .unwrap();
        *os = ServiceInfoKV::new_encoded("devmod:os", &42u32).unwrap();
        assert!(Devmod::from_service_info(&encoded).is_err());

        let mut encoded = devmod().to_service_info().unwrap();
        let active = encoded
            .iter_mut()
            .find(|kv| kv.key() == "devmod:active")
            .unwrap();
        *active = ServiceInfoKV::new_encoded("devmod:active", &false).unwrap();
        assert!(Devmod::from_service_info(&encoded).is_err());
    }

    #[test]
    fn test_split() {
        let entries: Vec<ServiceInfoKV> = (0..10)
            .map(|i| ServiceInfoKV::new(&format!("mod:key{}", i), vec![0u8; 100]))
            .collect();
        let parts = split_service_info(&entries, 300).unwrap();
        assert!(parts.len() > 1);
        for part in &parts {
            assert!(part.serialize_data().unwrap().len() <= 300);
        }
        let rejoined: Vec<ServiceInfoKV> = parts.into_iter().flatten().collect();
        assert_eq!(rejoined, entries);

        assert!(split_service_info(&entries, 50).is_err());
    }
}
