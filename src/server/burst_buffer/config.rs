use std::path::{Path, PathBuf};

use crate::common::conf::read_conf;
use crate::common::error::error;
use crate::server::burst_buffer::state::{BbGres, BbState};
use crate::server::burst_buffer::units::{parse_count, parse_size, parse_users, print_users};
use crate::server::burst_buffer::NO_VAL;
use crate::server::job::NICE_OFFSET;
use crate::UserId;

/// Burst buffer configuration, populated from `burst_buffer.conf`.
#[derive(Debug, Clone)]
pub struct BbConfig {
    pub allow_users: Vec<UserId>,
    pub allow_users_str: Option<String>,
    pub deny_users: Vec<UserId>,
    pub deny_users_str: Option<String>,
    pub get_sys_state: Option<PathBuf>,
    /// Allocation quantum in GiB, at least 1.
    pub granularity: u32,
    pub gres: Vec<BbGres>,
    /// `NO_VAL` when not configured.
    pub job_size_limit: u32,
    pub user_size_limit: u32,
    pub prio_boost_alloc: u32,
    pub prio_boost_use: u32,
    pub private_data: bool,
    pub stage_in_timeout: u32,
    pub stage_out_timeout: u32,
    pub start_stage_in: Option<PathBuf>,
    pub start_stage_out: Option<PathBuf>,
    pub stop_stage_in: Option<PathBuf>,
    pub stop_stage_out: Option<PathBuf>,
}

impl Default for BbConfig {
    fn default() -> Self {
        Self {
            allow_users: Vec::new(),
            allow_users_str: None,
            deny_users: Vec::new(),
            deny_users_str: None,
            get_sys_state: None,
            granularity: 1,
            gres: Vec::new(),
            job_size_limit: NO_VAL,
            user_size_limit: NO_VAL,
            prio_boost_alloc: 0,
            prio_boost_use: 0,
            private_data: false,
            stage_in_timeout: 0,
            stage_out_timeout: 0,
            start_stage_in: None,
            start_stage_out: None,
            stop_stage_in: None,
            stop_stage_out: None,
        }
    }
}

impl BbConfig {
    /// Reset to defaults. The configured GRES names survive an ordinary
    /// reload with their available counts zeroed; `fini` drops them too.
    pub fn reset(&mut self, fini: bool) {
        let mut gres = std::mem::take(&mut self.gres);
        if fini {
            gres.clear();
        } else {
            for entry in &mut gres {
                entry.avail_cnt = 0;
            }
        }
        *self = BbConfig {
            gres,
            ..BbConfig::default()
        };
    }
}

/// Load `burst_buffer.conf` (or `burst_buffer_<type>.conf`) from the
/// configuration directory and replace the state's configuration.
///
/// A missing configuration file is fatal to the subsystem and surfaces as
/// an error; malformed values are clamped or dropped with a log entry
/// where the format allows it.
pub fn load_config(state: &mut BbState, bb_type: &str, conf_dir: &Path) -> crate::Result<()> {
    state.config.reset(false);

    let mut conf_path = conf_dir.join("burst_buffer.conf");
    if !conf_path.is_file() {
        let typed = conf_dir.join(format!("burst_buffer_{bb_type}.conf"));
        if !typed.is_file() {
            return error(format!(
                "unable to find configuration file {} or burst_buffer.conf",
                typed.display()
            ));
        }
        conf_path = typed;
    }

    let mut options =
        read_conf(&conf_path).map_err(|e| crate::Error::ConfigError(e.to_string()))?;
    let config = &mut state.config;

    if let Some(value) = options.remove("allowusers") {
        config.allow_users = parse_users(&value);
        config.allow_users_str = Some(value);
    }
    if let Some(value) = options.remove("denyusers") {
        config.deny_users = parse_users(&value);
        config.deny_users_str = Some(value);
    }
    if let Some(value) = options.remove("getsysstate") {
        config.get_sys_state = Some(PathBuf::from(value));
    }
    if let Some(value) = options.remove("granularity") {
        config.granularity = parse_size(&value, 1);
        if config.granularity == 0 {
            log::error!("Granularity=0 is invalid");
            config.granularity = 1;
        }
    }
    if let Some(value) = options.remove("gres") {
        for tok in value.split(',').filter(|tok| !tok.is_empty()) {
            let (name, avail_cnt) = match tok.split_once(':') {
                Some((name, count)) => (name, parse_count(count)),
                None => (tok, 1),
            };
            match config.gres.iter_mut().find(|entry| entry.name == name) {
                Some(entry) => entry.avail_cnt = avail_cnt,
                None => config.gres.push(BbGres {
                    name: name.to_string(),
                    avail_cnt,
                    used_cnt: 0,
                }),
            }
        }
    }
    if let Some(value) = options.remove("jobsizelimit") {
        config.job_size_limit = parse_size(&value, 1);
    }
    if let Some(value) = options.remove("usersizelimit") {
        config.user_size_limit = parse_size(&value, 1);
    }
    if let Some(value) = options.remove("prioboostalloc") {
        config.prio_boost_alloc = parse_u32(&conf_path, "PrioBoostAlloc", &value)?;
        if config.prio_boost_alloc > NICE_OFFSET as u32 {
            log::error!("PrioBoostAlloc can not exceed {}", NICE_OFFSET);
            config.prio_boost_alloc = NICE_OFFSET as u32;
        }
    }
    if let Some(value) = options.remove("prioboostuse") {
        config.prio_boost_use = parse_u32(&conf_path, "PrioBoostUse", &value)?;
        if config.prio_boost_use > NICE_OFFSET as u32 {
            log::error!("PrioBoostUse can not exceed {}", NICE_OFFSET);
            config.prio_boost_use = NICE_OFFSET as u32;
        }
    }
    if let Some(value) = options.remove("privatedata") {
        config.private_data = value.eq_ignore_ascii_case("true")
            || value.eq_ignore_ascii_case("yes")
            || value == "1";
    }
    if let Some(value) = options.remove("stageintimeout") {
        config.stage_in_timeout = parse_u32(&conf_path, "StageInTimeout", &value)?;
    }
    if let Some(value) = options.remove("stageouttimeout") {
        config.stage_out_timeout = parse_u32(&conf_path, "StageOutTimeout", &value)?;
    }
    if let Some(value) = options.remove("startstagein") {
        config.start_stage_in = Some(PathBuf::from(value));
    }
    if let Some(value) = options.remove("startstageout") {
        config.start_stage_out = Some(PathBuf::from(value));
    }
    if let Some(value) = options.remove("stopstagein") {
        config.stop_stage_in = Some(PathBuf::from(value));
    }
    if let Some(value) = options.remove("stopstageout") {
        config.stop_stage_out = Some(PathBuf::from(value));
    }

    if let Some(key) = options.keys().next() {
        return Err(crate::Error::ConfigError(format!(
            "{}: unrecognized option {}",
            conf_path.display(),
            key
        )));
    }

    log::debug!("AllowUsers:{}", print_users(&config.allow_users));
    log::debug!("DenyUsers:{}", print_users(&config.deny_users));
    log::debug!("GetSysState:{:?}", config.get_sys_state);
    log::debug!("Granularity:{}", config.granularity);
    for (index, entry) in config.gres.iter().enumerate() {
        log::debug!("Gres[{}]:{}:{}", index, entry.name, entry.avail_cnt);
    }
    log::debug!("JobSizeLimit:{}", config.job_size_limit);
    log::debug!("PrioBoostAlloc:{}", config.prio_boost_alloc);
    log::debug!("PrioBoostUse:{}", config.prio_boost_use);
    log::debug!("StageInTimeout:{}", config.stage_in_timeout);
    log::debug!("StageOutTimeout:{}", config.stage_out_timeout);
    log::debug!("StartStageIn:{:?}", config.start_stage_in);
    log::debug!("StartStageOut:{:?}", config.start_stage_out);
    log::debug!("StopStageIn:{:?}", config.stop_stage_in);
    log::debug!("StopStageOut:{:?}", config.stop_stage_out);
    log::debug!("UserSizeLimit:{}", config.user_size_limit);

    Ok(())
}

fn parse_u32(conf_path: &Path, key: &str, value: &str) -> crate::Result<u32> {
    value.parse::<u32>().map_err(|_| {
        crate::Error::ConfigError(format!(
            "{}: invalid {key} value '{value}'",
            conf_path.display()
        ))
    })
}
