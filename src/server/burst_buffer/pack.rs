use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::server::burst_buffer::config::BbConfig;
use crate::server::burst_buffer::state::{BbAlloc, BbAllocState, BbGres, BbState, GresList};
use crate::UserId;

/// Pack the burst buffer state and configuration for transmission.
///
/// All integers are little-endian; strings are u32 length-prefixed UTF-8
/// with `None` encoded as length 0.
pub fn pack_state(state: &BbState) -> Bytes {
    let config = &state.config;
    let mut buf = BytesMut::new();
    pack_str(&mut buf, config.allow_users_str.as_deref());
    pack_str(&mut buf, config.deny_users_str.as_deref());
    pack_path(&mut buf, &config.get_sys_state);
    buf.put_u32_le(config.granularity);
    buf.put_u32_le(config.gres.len() as u32);
    for gres in &config.gres {
        pack_gres(&mut buf, gres);
    }
    buf.put_u16_le(config.private_data as u16);
    pack_path(&mut buf, &config.start_stage_in);
    pack_path(&mut buf, &config.start_stage_out);
    pack_path(&mut buf, &config.stop_stage_in);
    pack_path(&mut buf, &config.stop_stage_out);
    buf.put_u32_le(config.job_size_limit);
    buf.put_u32_le(config.prio_boost_alloc);
    buf.put_u32_le(config.prio_boost_use);
    buf.put_u32_le(config.stage_in_timeout);
    buf.put_u32_le(config.stage_out_timeout);
    buf.put_u32_le(state.total_space);
    buf.put_u32_le(state.used_space);
    buf.put_u32_le(config.user_size_limit);
    buf.freeze()
}

/// Inverse of [`pack_state`]. The UID arrays are not on the wire; they are
/// re-derived when the user list strings are re-parsed.
pub fn unpack_state(buf: &mut Bytes) -> crate::Result<(BbConfig, u32, u32)> {
    let mut config = BbConfig::default();
    config.allow_users_str = unpack_str(buf)?;
    config.deny_users_str = unpack_str(buf)?;
    config.get_sys_state = unpack_str(buf)?.map(Into::into);
    config.granularity = unpack_u32(buf)?;
    let gres_cnt = unpack_u32(buf)?;
    for _ in 0..gres_cnt {
        let gres = unpack_gres(buf)?;
        config.gres.push(gres);
    }
    config.private_data = unpack_u16(buf)? != 0;
    config.start_stage_in = unpack_str(buf)?.map(Into::into);
    config.start_stage_out = unpack_str(buf)?.map(Into::into);
    config.stop_stage_in = unpack_str(buf)?.map(Into::into);
    config.stop_stage_out = unpack_str(buf)?.map(Into::into);
    config.job_size_limit = unpack_u32(buf)?;
    config.prio_boost_alloc = unpack_u32(buf)?;
    config.prio_boost_use = unpack_u32(buf)?;
    config.stage_in_timeout = unpack_u32(buf)?;
    config.stage_out_timeout = unpack_u32(buf)?;
    let total_space = unpack_u32(buf)?;
    let used_space = unpack_u32(buf)?;
    config.user_size_limit = unpack_u32(buf)?;
    Ok((config, total_space, used_space))
}

/// Pack the allocation records visible to `uid`: UID 0 (operator) sees
/// every record, any other UID only its own. Returns the buffer and the
/// number of records packed.
pub fn pack_bufs(uid: UserId, state: &BbState) -> (Bytes, u32) {
    let mut buf = BytesMut::new();
    let mut rec_count = 0;
    for alloc in state.allocs() {
        if uid != 0 && uid != alloc.user_id {
            continue;
        }
        buf.put_u32_le(alloc.array_job_id);
        buf.put_u32_le(alloc.array_task_id);
        buf.put_u32_le(alloc.gres.len() as u32);
        for gres in &alloc.gres {
            pack_gres(&mut buf, gres);
        }
        buf.put_u32_le(alloc.job_id);
        pack_str(&mut buf, alloc.name.as_deref());
        buf.put_u32_le(alloc.size);
        buf.put_u16_le(alloc.state as u16);
        buf.put_u64_le(alloc.state_time);
        buf.put_u32_le(alloc.user_id);
        rec_count += 1;
    }
    (buf.freeze(), rec_count)
}

/// Inverse of [`pack_bufs`]: read records until the buffer is exhausted.
/// Only the packed fields are recovered; the rest are unset.
pub fn unpack_bufs(buf: &mut Bytes) -> crate::Result<Vec<BbAlloc>> {
    let mut records = Vec::new();
    while buf.has_remaining() {
        let array_job_id = unpack_u32(buf)?;
        let array_task_id = unpack_u32(buf)?;
        let gres_cnt = unpack_u32(buf)?;
        let mut gres = GresList::new();
        for _ in 0..gres_cnt {
            gres.push(unpack_gres(buf)?);
        }
        let job_id = unpack_u32(buf)?;
        let name = unpack_str(buf)?;
        let size = unpack_u32(buf)?;
        let state_raw = unpack_u16(buf)?;
        let state = BbAllocState::from_u16(state_raw).ok_or_else(|| {
            crate::Error::DeserializationError(format!("invalid buffer state {state_raw}"))
        })?;
        let state_time = unpack_u64(buf)?;
        let user_id = unpack_u32(buf)?;
        records.push(BbAlloc {
            name,
            job_id,
            array_job_id,
            array_task_id,
            user_id,
            size,
            state,
            state_time,
            seen_time: 0,
            use_time: 0,
            end_time: 0,
            gres,
        });
    }
    Ok(records)
}

fn pack_gres(buf: &mut BytesMut, gres: &BbGres) {
    pack_str(buf, Some(&gres.name));
    buf.put_u32_le(gres.avail_cnt);
    buf.put_u32_le(gres.used_cnt);
}

fn unpack_gres(buf: &mut Bytes) -> crate::Result<BbGres> {
    let name = unpack_str(buf)?.unwrap_or_default();
    let avail_cnt = unpack_u32(buf)?;
    let used_cnt = unpack_u32(buf)?;
    Ok(BbGres {
        name,
        avail_cnt,
        used_cnt,
    })
}

fn pack_str(buf: &mut BytesMut, value: Option<&str>) {
    match value {
        Some(text) => {
            buf.put_u32_le(text.len() as u32);
            buf.put_slice(text.as_bytes());
        }
        None => buf.put_u32_le(0),
    }
}

fn pack_path(buf: &mut BytesMut, path: &Option<std::path::PathBuf>) {
    let text = path.as_ref().map(|p| p.to_string_lossy());
    pack_str(buf, text.as_deref());
}

fn unpack_str(buf: &mut Bytes) -> crate::Result<Option<String>> {
    let len = unpack_u32(buf)? as usize;
    if len == 0 {
        return Ok(None);
    }
    ensure(buf, len)?;
    let bytes = buf.split_to(len);
    String::from_utf8(bytes.to_vec())
        .map(Some)
        .map_err(|_| crate::Error::DeserializationError("invalid UTF-8 string".to_string()))
}

fn unpack_u16(buf: &mut Bytes) -> crate::Result<u16> {
    ensure(buf, 2)?;
    Ok(buf.get_u16_le())
}

fn unpack_u32(buf: &mut Bytes) -> crate::Result<u32> {
    ensure(buf, 4)?;
    Ok(buf.get_u32_le())
}

fn unpack_u64(buf: &mut Bytes) -> crate::Result<u64> {
    ensure(buf, 8)?;
    Ok(buf.get_u64_le())
}

fn ensure(buf: &Bytes, len: usize) -> crate::Result<()> {
    if buf.remaining() < len {
        return Err(crate::Error::DeserializationError(
            "truncated buffer".to_string(),
        ));
    }
    Ok(())
}
