use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Keys of the `devmod` service info module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DevmodSim {
    Active,
    Os,
    Arch,
    Version,
    Device,
    SerialNumber,
    PathSeparator,
    Separator,
    Newline,
    Tmp,
    Dir,
    ProgrammingEnvironment,
    Bin,
    MudUrl,
    NumModules,
    Modules,
}

pub const MANDATORY_DEVMOD_SIMS: &[DevmodSim] = &[
    DevmodSim::Active,
    DevmodSim::Os,
    DevmodSim::Arch,
    DevmodSim::Version,
    DevmodSim::Device,
    DevmodSim::Separator,
    DevmodSim::Bin,
    DevmodSim::NumModules,
    DevmodSim::Modules,
];

impl DevmodSim {
    pub fn key(&self) -> &'static str {
        match self {
            DevmodSim::Active => "devmod:active",
            DevmodSim::Os => "devmod:os",
            DevmodSim::Arch => "devmod:arch",
            DevmodSim::Version => "devmod:version",
            DevmodSim::Device => "devmod:device",
            DevmodSim::SerialNumber => "devmod:sn",
            DevmodSim::PathSeparator => "devmod:pathsep",
            DevmodSim::Separator => "devmod:sep",
            DevmodSim::Newline => "devmod:nl",
            DevmodSim::Tmp => "devmod:tmp",
            DevmodSim::Dir => "devmod:dir",
            DevmodSim::ProgrammingEnvironment => "devmod:progenv",
            DevmodSim::Bin => "devmod:bin",
            DevmodSim::MudUrl => "devmod:mudurl",
            DevmodSim::NumModules => "devmod:nummodules",
            DevmodSim::Modules => "devmod:modules",
        }
    }
}

impl fmt::Display for DevmodSim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for DevmodSim {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Ok(match s {
            "devmod:active" => DevmodSim::Active,
            "devmod:os" => DevmodSim::Os,
            "devmod:arch" => DevmodSim::Arch,
            "devmod:version" => DevmodSim::Version,
            "devmod:device" => DevmodSim::Device,
            "devmod:sn" => DevmodSim::SerialNumber,
            "devmod:pathsep" => DevmodSim::PathSeparator,
            "devmod:sep" => DevmodSim::Separator,
            "devmod:nl" => DevmodSim::Newline,
            "devmod:tmp" => DevmodSim::Tmp,
            "devmod:dir" => DevmodSim::Dir,
            "devmod:progenv" => DevmodSim::ProgrammingEnvironment,
            "devmod:bin" => DevmodSim::Bin,
            "devmod:mudurl" => DevmodSim::MudUrl,
            "devmod:nummodules" => DevmodSim::NumModules,
            "devmod:modules" => DevmodSim::Modules,
            _ => return Err(Error::InconsistentValue("devmod key")),
        })
    }
}
