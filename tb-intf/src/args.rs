// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use clap::{App, AppSettings, ArgMatches};
use serde::{Deserialize, Serialize};

use tb_util::*;

lazy_static::lazy_static! {
    static ref ARGS_STR: String = {
        let dfl_args = Args::default();
        format!(
            "-c, --config=[FILE]           'Experiment configuration, will be created if non-existent'
             -r, --report=[FILE]           'Report file, FILE.staging will be used for staging'
             -i, --interval=[DUR]          'Report update interval (default: {dfl_intv})'
             -p, --poll-interval=[DUR]     'Override the workload poll interval of the configuration'
             -a, --args=[FILE]             'Load base command line arguments from FILE'
                 --check                   'Validate the configuration and exit'
             -v...                         'Sets the level of verbosity'",
            dfl_intv = format_duration(dfl_args.interval),
        )
    };
}

const ARGS_DOC: &str = "\
//
// testbed-run command line arguments
//
// This file provides the base values for a subset of command line arguments.
// They can be overridden from command line.
//
";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Args {
    pub config: Option<String>,
    pub report: Option<String>,
    pub interval: f64,
    pub poll_interval: Option<f64>,

    #[serde(skip)]
    pub check: bool,
    #[serde(skip)]
    pub verbosity: u32,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config: None,
            report: None,
            interval: 5.0,
            poll_interval: None,
            check: false,
            verbosity: 0,
        }
    }
}

impl JsonLoad for Args {}

impl JsonSave for Args {
    fn preamble() -> Option<String> {
        Some(ARGS_DOC.to_string())
    }
}

impl Args {
    #[allow(dangerous_implicit_autorefs)]
    fn match_args<I, T>(iter: I) -> clap::Result<ArgMatches<'static>>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        App::new("testbed-run")
            .version(*super::VERSION)
            .author(clap::crate_authors!("\n"))
            .about("Runs closed-loop resource control experiments")
            .args_from_usage(&ARGS_STR)
            .setting(AppSettings::UnifiedHelpMessage)
            .setting(AppSettings::DeriveDisplayOrder)
            .get_matches_from_safe(iter)
    }
}

impl JsonArgs for Args {
    fn match_cmdline() -> ArgMatches<'static> {
        match Self::match_args(std::env::args_os()) {
            Ok(v) => v,
            Err(e) => e.exit(),
        }
    }

    fn verbosity(matches: &ArgMatches) -> u32 {
        matches.occurrences_of("v") as u32
    }

    fn process_cmdline(&mut self, matches: &ArgMatches) -> Result<bool> {
        let dfl: Args = Default::default();
        let mut updated_base = false;

        if let Some(v) = matches.value_of("config") {
            self.config = if v.len() > 0 {
                Some(v.to_string())
            } else {
                None
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("report") {
            self.report = if v.len() > 0 {
                Some(v.to_string())
            } else {
                None
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("interval") {
            self.interval = if v.len() > 0 {
                parse_duration(v).with_context(|| format!("invalid --interval {:?}", v))?
            } else {
                dfl.interval
            };
            updated_base = true;
        }

        if let Some(v) = matches.value_of("poll-interval") {
            self.poll_interval = if v.len() > 0 {
                Some(parse_duration(v).with_context(|| format!("invalid --poll-interval {:?}", v))?)
            } else {
                None
            };
            updated_base = true;
        }

        self.check = matches.is_present("check");
        self.verbosity = Self::verbosity(matches);

        Ok(updated_base)
    }
}
