// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use clap;
use log::info;
use serde::{de::DeserializeOwned, Serialize};
use serde_json;
use std::default::Default;
use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

/// Comment lines (`//` or `#`) are blanked out so that serde_json error
/// positions still match the file.
fn read_json_body<P: AsRef<Path>>(path: P) -> Result<String> {
    let mut f = fs::OpenOptions::new().read(true).open(path)?;
    let mut buf = String::new();
    f.read_to_string(&mut buf)?;

    let mut body = String::new();
    for line in buf.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with("//") && !trimmed.starts_with("#") {
            body += line;
        }
        body += "\n";
    }
    Ok(body)
}

pub trait JsonLoad
where
    Self: DeserializeOwned,
{
    /// Called after a successful parse. Validation failures should be
    /// reported here so that they surface at load time.
    fn loaded(&mut self) -> Result<()> {
        Ok(())
    }

    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let body = read_json_body(path)?;
        Ok(serde_json::from_str::<Self>(&body)?)
    }
}

pub trait JsonSave
where
    Self: Default + Serialize,
{
    fn preamble() -> Option<String> {
        None
    }

    fn maybe_create_dfl<P: AsRef<Path>>(path_in: P) -> Result<bool> {
        let path = path_in.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(&parent)?;
        }

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut f) => {
                let data: Self = Default::default();
                f.write_all(data.as_json()?.as_ref())?;
                Ok(true)
            }
            Err(e) => match e.kind() {
                io::ErrorKind::AlreadyExists => Ok(false),
                _ => Err(e.into()),
            },
        }
    }

    fn as_json(&self) -> Result<String> {
        let mut serialized = serde_json::to_string_pretty(&self)?;
        if !serialized.ends_with("\n") {
            serialized += "\n";
        }
        match Self::preamble() {
            Some(pre) => Ok(pre + &serialized),
            None => Ok(serialized),
        }
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut f = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        f.write_all(self.as_json()?.as_ref())?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct JsonConfigFile<T: JsonLoad + JsonSave> {
    pub path: Option<PathBuf>,
    pub data: T,
}

impl<T: JsonLoad + JsonSave> JsonConfigFile<T> {
    pub fn load<P: AsRef<Path>>(path_in: P) -> Result<Self> {
        let path = AsRef::<Path>::as_ref(&path_in);

        let mut data = T::load(&path).with_context(|| format!("Failed to load {:?}", path))?;
        data.loaded()
            .with_context(|| format!("Invalid configuration in {:?}", path))?;

        Ok(Self {
            path: Some(PathBuf::from(path)),
            data,
        })
    }

    pub fn load_or_create<P: AsRef<Path>>(path_opt: Option<P>) -> Result<Self> {
        match path_opt {
            Some(path_in) => {
                let path = AsRef::<Path>::as_ref(&path_in);

                if T::maybe_create_dfl(&path)? {
                    info!("cfg: Created {:?}", &path);
                }

                Self::load(path)
            }
            None => {
                let mut data: T = Default::default();
                data.loaded()?;

                Ok(Self { path: None, data })
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        if let Some(path) = self.path.as_deref() {
            self.data.save(&path)
        } else {
            Ok(())
        }
    }
}

pub trait JsonArgs
where
    Self: JsonLoad + JsonSave,
{
    fn match_cmdline() -> clap::ArgMatches<'static>;
    fn verbosity(matches: &clap::ArgMatches) -> u32;
    fn process_cmdline(&mut self, matches: &clap::ArgMatches) -> Result<bool>;
}

pub trait JsonArgsHelper
where
    Self: JsonArgs,
{
    fn init_args_and_logging_nosave() -> Result<(JsonConfigFile<Self>, bool)>;
    fn save_args(args_file: &JsonConfigFile<Self>) -> Result<()>;
    fn init_args_and_logging() -> Result<JsonConfigFile<Self>>;
}

impl<T> JsonArgsHelper for T
where
    T: JsonArgs,
{
    fn init_args_and_logging_nosave() -> Result<(JsonConfigFile<T>, bool)> {
        let matches = T::match_cmdline();
        super::init_logging(T::verbosity(&matches));

        let mut args_file = JsonConfigFile::<T>::load_or_create(matches.value_of("args").as_ref())?;
        let updated = args_file.data.process_cmdline(&matches)?;

        Ok((args_file, updated))
    }

    fn save_args(args_file: &JsonConfigFile<T>) -> Result<()> {
        if let Some(path) = args_file.path.as_deref() {
            info!("Updating command line arguments file {:?}", path);
            args_file.save()?;
        }
        Ok(())
    }

    fn init_args_and_logging() -> Result<JsonConfigFile<T>> {
        let (args_file, updated) = Self::init_args_and_logging_nosave()?;
        if updated {
            Self::save_args(&args_file)?;
        }
        Ok(args_file)
    }
}

/// A report file which is written to `PATH.staging` first and then renamed
/// over `PATH` so that readers never see a partial report.
#[derive(Debug)]
pub struct JsonReportFile<T: JsonSave> {
    pub path: Option<PathBuf>,
    pub staging: PathBuf,
    pub data: T,
}

impl<T: JsonSave> JsonReportFile<T> {
    pub fn new<P: AsRef<Path>>(path_opt: Option<P>) -> Self {
        let (path, staging) = match path_opt {
            Some(p) => {
                let pb = PathBuf::from(p.as_ref());
                let mut st = pb.clone().into_os_string();
                st.push(".staging");
                (Some(pb), PathBuf::from(st))
            }
            None => (None, PathBuf::new()),
        };

        Self {
            path,
            staging,
            data: Default::default(),
        }
    }

    pub fn commit(&self) -> Result<()> {
        let path = match self.path.as_ref() {
            Some(v) => v,
            None => return Ok(()),
        };

        self.data.save(&self.staging)?;
        fs::rename(&self.staging, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{JsonConfigFile, JsonLoad, JsonReportFile, JsonSave};
    use anyhow::{bail, Result};
    use serde::{Deserialize, Serialize};
    use std::fs;

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    #[serde(default)]
    struct Knobs {
        interval: f64,
        name: String,
    }

    impl Default for Knobs {
        fn default() -> Self {
            Self {
                interval: 5.0,
                name: "knobs".into(),
            }
        }
    }

    impl JsonLoad for Knobs {
        fn loaded(&mut self) -> Result<()> {
            if self.interval <= 0.0 {
                bail!("interval must be positive");
            }
            Ok(())
        }
    }

    impl JsonSave for Knobs {
        fn preamble() -> Option<String> {
            Some("//\n// test knobs\n//\n".into())
        }
    }

    #[test]
    fn test_load_or_create() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sub/knobs.json");

        let cfg = JsonConfigFile::<Knobs>::load_or_create(Some(&path)).unwrap();
        assert_eq!(cfg.data, Knobs::default());
        let written = fs::read_to_string(&path).unwrap();
        println!("{}", &written);
        assert!(written.starts_with("//\n// test knobs"));

        fs::write(&path, "// edited\n{ \"interval\": 2.5 }\n").unwrap();
        let cfg = JsonConfigFile::<Knobs>::load(&path).unwrap();
        assert_eq!(cfg.data.interval, 2.5);
        assert_eq!(cfg.data.name, "knobs");

        fs::write(&path, "{ \"interval\": -1 }\n").unwrap();
        assert!(JsonConfigFile::<Knobs>::load(&path).is_err());

        let cfg = JsonConfigFile::<Knobs>::load_or_create(None::<&str>).unwrap();
        assert!(cfg.path.is_none());
        cfg.save().unwrap();
    }

    #[test]
    fn test_report_commit() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("report.json");

        let mut rf = JsonReportFile::<Knobs>::new(Some(&path));
        rf.data.name = "report".into();
        rf.commit().unwrap();
        assert!(!rf.staging.exists());
        assert_eq!(Knobs::load(&path).unwrap().name, "report");

        JsonReportFile::<Knobs>::new(None::<&str>).commit().unwrap();
    }
}
