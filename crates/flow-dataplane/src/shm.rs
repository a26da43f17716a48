//! Shared-memory telemetry region and the sealed frame rings.
//!
//! One POSIX shm object per VIP (`shm_vip_<id>`) carries, after a reserved
//! header, the blocks listed in [`crate::stats::layout`]: the active-AS
//! header, reference timestamps, the outbound counter cache and its 4-frame
//! ring, the reservoir blocks, and the inbound weight cache and ring.
//!
//! Exactly two parties touch the region: the single data-plane worker
//! ([`VipShm`]) and the external consumer ([`ConsumerEndpoint`]). There are
//! no locks; each ring slot is sealed by its `id` field, which the producer
//! stores last (after a release fence) and the consumer re-checks after
//! copying the body, discarding torn frames.
//!
//! The wire contract starts the typed layout at byte 42, which leaves every
//! record in the region misaligned. No reference is ever formed into the
//! mapping: the worker keeps an aligned working set in process memory
//! ([`VipState`]) and moves bytes in and out with unaligned copies on each
//! publish tick.

use crate::reservoir::{AsReservoir, VipReservoir};
use crate::stats::{layout, AliasEntry, AsStat, MsgIn, MsgOut, RefAs, RefLb, AS_MAX, FRAME_COUNT, FRAME_MASK, SHM_OFFSET};
use anyhow::{bail, Context, Result};
use std::ffi::CString;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Region backing
// ---------------------------------------------------------------------------

/// Heap backing for test regions; freed when the last view drops.
struct AnonBuf {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for AnonBuf {}
unsafe impl Sync for AnonBuf {}

impl Drop for AnonBuf {
    fn drop(&mut self) {
        unsafe {
            let l = std::alloc::Layout::from_size_align_unchecked(self.len, 64);
            std::alloc::dealloc(self.ptr, l);
        }
    }
}

enum Backing {
    /// `shm_open` + `mmap`; unmapped and closed on drop, unlinked explicitly.
    Posix { name: String, fd: libc::c_int },
    /// Shared heap allocation, for tests. `share()` hands out more views.
    Anon(Arc<AnonBuf>),
}

/// A mapped byte region. All access is through raw unaligned copies; the
/// region is never reinterpreted as typed memory.
pub struct ShmRegion {
    ptr: *mut u8,
    len: usize,
    backing: Backing,
}

unsafe impl Send for ShmRegion {}

impl ShmRegion {
    /// Create (or reopen) and map the POSIX object `name` at `len` bytes.
    pub fn create(name: &str, len: usize) -> Result<Self> {
        Self::open(name, len, true)
    }

    /// Map an existing POSIX object without creating it.
    pub fn attach(name: &str, len: usize) -> Result<Self> {
        Self::open(name, len, false)
    }

    fn open(name: &str, len: usize, create: bool) -> Result<Self> {
        let c_name = CString::new(name).context("shm name contains NUL")?;
        let flags = if create { libc::O_RDWR | libc::O_CREAT } else { libc::O_RDWR };
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), flags, 0o777) };
        if fd < 0 {
            bail!("shm_open {name}: {}", std::io::Error::last_os_error());
        }
        if create && unsafe { libc::ftruncate(fd, len as libc::off_t) } < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            bail!("ftruncate {name} to {len}: {err}");
        }
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            bail!("mmap {name}: {err}");
        }
        Ok(Self {
            ptr: ptr as *mut u8,
            len,
            backing: Backing::Posix { name: name.to_string(), fd },
        })
    }

    /// A zero-filled in-process region with shm semantics, for tests.
    pub fn anonymous(len: usize) -> Self {
        let layout = std::alloc::Layout::from_size_align(len, 64).expect("bad region size");
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "region allocation failed");
        Self {
            ptr,
            len,
            backing: Backing::Anon(Arc::new(AnonBuf { ptr, len })),
        }
    }

    /// Another view of the same anonymous region (the "other process" in
    /// tests). Returns `None` for POSIX regions — attach by name instead.
    pub fn share(&self) -> Option<Self> {
        match &self.backing {
            Backing::Anon(buf) => Some(Self {
                ptr: self.ptr,
                len: self.len,
                backing: Backing::Anon(buf.clone()),
            }),
            Backing::Posix { .. } => None,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Name of the backing POSIX object, if any.
    pub fn name(&self) -> Option<&str> {
        match &self.backing {
            Backing::Posix { name, .. } => Some(name),
            Backing::Anon(_) => None,
        }
    }

    /// Copy a record into the region at `off` (bytes from the region base).
    #[inline]
    fn write_block<T: Copy>(&mut self, off: usize, src: &T) {
        debug_assert!(off + std::mem::size_of::<T>() <= self.len);
        unsafe {
            std::ptr::copy_nonoverlapping(
                src as *const T as *const u8,
                self.ptr.add(off),
                std::mem::size_of::<T>(),
            );
        }
    }

    /// Copy a record out of the region at `off`.
    #[inline]
    fn read_block<T: Copy>(&self, off: usize) -> T {
        debug_assert!(off + std::mem::size_of::<T>() <= self.len);
        unsafe {
            let mut out = std::mem::MaybeUninit::<T>::uninit();
            std::ptr::copy_nonoverlapping(
                self.ptr.add(off),
                out.as_mut_ptr() as *mut u8,
                std::mem::size_of::<T>(),
            );
            out.assume_init()
        }
    }

    #[inline]
    fn read_u32(&self, off: usize) -> u32 {
        self.read_block::<u32>(off)
    }

    #[inline]
    fn write_u32(&mut self, off: usize, v: u32) {
        self.write_block(off, &v);
    }

    fn zero(&mut self) {
        unsafe { std::ptr::write_bytes(self.ptr, 0, self.len) };
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        if let Backing::Posix { name, fd } = &self.backing {
            unsafe {
                if libc::munmap(self.ptr as *mut libc::c_void, self.len) < 0 {
                    debug!("munmap {name}: {}", std::io::Error::last_os_error());
                }
                libc::close(*fd);
            }
        }
    }
}

/// Remove a POSIX shm object by VIP id. Idempotent: a missing object is not
/// an error, so teardown can be retried.
pub fn unlink_vip(vip_id: u32) -> Result<()> {
    let name = vip_shm_name(vip_id);
    let c_name = CString::new(name.as_str())?;
    if unsafe { libc::shm_unlink(c_name.as_ptr()) } < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOENT) {
            bail!("shm_unlink {name}: {err}");
        }
    }
    Ok(())
}

pub fn vip_shm_name(vip_id: u32) -> String {
    format!("shm_vip_{vip_id}")
}

// ---------------------------------------------------------------------------
// Seal helpers
// ---------------------------------------------------------------------------

/// True iff sealed id `a` is strictly newer than `b` (wrap-safe).
#[inline]
fn id_newer(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) as i32 > 0
}

/// Copy-then-verify read of one sealed frame. Returns the body only if the
/// seal did not move while the body was being copied.
#[inline]
fn read_sealed<T: Copy>(region: &ShmRegion, off: usize, id: u32) -> Option<T> {
    fence(Ordering::Acquire);
    let body: T = region.read_block(off);
    fence(Ordering::Acquire);
    let id_after = region.read_u32(off);
    (id_after == id).then_some(body)
}

/// Seal one frame: body first, then the id, with a release fence between.
#[inline]
fn write_sealed<T: Copy>(region: &mut ShmRegion, off: usize, body: &T, id: u32) {
    region.write_block(off, body);
    fence(Ordering::Release);
    region.write_u32(off, id);
}

// ---------------------------------------------------------------------------
// Data-plane endpoint
// ---------------------------------------------------------------------------

/// Aligned working set of one VIP's telemetry, owned by the data-plane
/// worker and mirrored into the shared region on every publish tick.
pub struct VipState {
    pub n_as: u8,
    pub ref_lb: RefLb,
    pub ref_as: Box<[RefAs; AS_MAX]>,
    /// Live counters; `id` stays 0 here, frames get the sequence id on copy.
    pub out_cache: Box<MsgOut>,
    pub res_lb: VipReservoir,
    pub res_as: Box<[AsReservoir; AS_MAX]>,
    /// Freshest accepted inbound frame; `id` is the last accepted sequence.
    pub in_cache: Box<MsgIn>,
}

impl VipState {
    pub fn new() -> Self {
        Self {
            n_as: AS_MAX as u8,
            ref_lb: RefLb::default(),
            ref_as: Box::new([RefAs::default(); AS_MAX]),
            out_cache: Box::new(MsgOut::default()),
            res_lb: VipReservoir::default(),
            res_as: Box::new([AsReservoir::default(); AS_MAX]),
            in_cache: Box::new(MsgIn::default()),
        }
    }

    #[inline]
    pub fn stat(&self, id: u32) -> &AsStat {
        &self.out_cache.body[id as usize]
    }

    #[inline]
    pub fn stat_mut(&mut self, id: u32) -> &mut AsStat {
        &mut self.out_cache.body[id as usize]
    }
}

impl Default for VipState {
    fn default() -> Self {
        Self::new()
    }
}

/// The data-plane side of one VIP's region: owns the working set, publishes
/// outbound frames and pulls inbound weight frames.
pub struct VipShm {
    region: ShmRegion,
    state: VipState,
    seq_out: u32,
}

impl VipShm {
    /// Create and initialise the region for `vip_id`.
    pub fn create(vip_id: u32, size: usize) -> Result<Self> {
        let region = ShmRegion::create(&vip_shm_name(vip_id), size)?;
        info!("vip {vip_id}: shared region {} mapped ({size} bytes)", vip_shm_name(vip_id));
        Self::with_region(region)
    }

    /// Wrap an already mapped region (tests use an anonymous one).
    pub fn with_region(mut region: ShmRegion) -> Result<Self> {
        if region.len() < SHM_OFFSET + layout::END {
            bail!(
                "region of {} bytes cannot hold the {}-byte layout",
                region.len(),
                SHM_OFFSET + layout::END
            );
        }
        // A reopened object may carry stale frames from a previous run.
        region.zero();
        let mut shm = Self {
            region,
            state: VipState::new(),
            seq_out: 0,
        };
        shm.mirror_state();
        Ok(shm)
    }

    #[inline]
    pub fn state(&self) -> &VipState {
        &self.state
    }

    #[inline]
    pub fn state_mut(&mut self) -> &mut VipState {
        &mut self.state
    }

    /// Mark backend `id` active and reset its blocks to defaults.
    pub fn register_as(&mut self, id: u32) -> Result<()> {
        let idx = id as usize;
        if idx >= AS_MAX {
            bail!("backend index {id} out of range (max {AS_MAX})");
        }
        let st = &mut self.state;
        st.ref_as[idx] = RefAs::default();
        st.out_cache.body[idx] = AsStat { as_index: id, ..Default::default() };
        st.res_as[idx] = AsReservoir::default();
        st.in_cache.score[idx] = 1.0;
        st.in_cache.weights[idx] = AliasEntry::default();
        st.out_cache.mark_active(idx);
        Ok(())
    }

    /// Mute backend `id` and clear its ref/stat/weight blocks.
    pub fn remove_as(&mut self, id: u32) -> Result<()> {
        let idx = id as usize;
        if idx >= AS_MAX {
            bail!("backend index {id} out of range (max {AS_MAX})");
        }
        let st = &mut self.state;
        st.out_cache.mark_inactive(idx);
        st.ref_as[idx] = RefAs::default();
        st.out_cache.body[idx] = AsStat::default();
        st.res_as[idx] = AsReservoir::default();
        st.in_cache.score[idx] = 0.0;
        st.in_cache.weights[idx] = AliasEntry::default();
        Ok(())
    }

    /// Mirror the aligned working set into the region at the wire offsets.
    fn mirror_state(&mut self) {
        let r = &mut self.region;
        r.write_block(SHM_OFFSET + layout::N_AS, &self.state.n_as);
        r.write_block(SHM_OFFSET + layout::REF_LB, &self.state.ref_lb);
        r.write_block(SHM_OFFSET + layout::REF_AS, &*self.state.ref_as);
        r.write_block(SHM_OFFSET + layout::MSG_OUT_CACHE, &*self.state.out_cache);
        r.write_block(SHM_OFFSET + layout::RES_LB, &self.state.res_lb);
        r.write_block(SHM_OFFSET + layout::RES_AS, &*self.state.res_as);
        r.write_block(SHM_OFFSET + layout::MSG_IN_CACHE, &*self.state.in_cache);
    }

    /// Publish the counter cache as the next outbound frame.
    ///
    /// The cache's own id is always 0, so a frame is visible to the reader
    /// only once its sequence id lands — the id store is the seal and goes
    /// last, after a release fence.
    pub fn publish(&mut self, now: f32) -> u32 {
        self.state.out_cache.ts = now;
        self.mirror_state();
        self.seq_out = self.seq_out.wrapping_add(1);
        let off = SHM_OFFSET + layout::msg_out_frame((self.seq_out & FRAME_MASK) as usize);
        write_sealed(&mut self.region, off, &*self.state.out_cache, self.seq_out);
        self.seq_out
    }

    /// Pull the freshest inbound weight frame, if any.
    ///
    /// Scans all ring slots and takes the highest id newer than the last
    /// accepted one — robust against wraparound, unlike following the id
    /// chain slot by slot. A frame that tears while being copied is simply
    /// dropped; the next tick retries.
    pub fn fetch_weights(&mut self) -> bool {
        let last = self.state.in_cache.id;
        let mut best: Option<(u32, usize)> = None;
        for k in 0..FRAME_COUNT {
            let off = SHM_OFFSET + layout::msg_in_frame(k);
            let id = self.region.read_u32(off);
            if id_newer(id, last) && best.map_or(true, |(b, _)| id_newer(id, b)) {
                best = Some((id, off));
            }
        }
        let Some((id, off)) = best else {
            return false;
        };
        let Some(frame) = read_sealed::<MsgIn>(&self.region, off, id) else {
            debug!("inbound frame {id} torn mid-copy, retrying next tick");
            return false;
        };
        *self.state.in_cache = frame;
        self.region
            .write_block(SHM_OFFSET + layout::MSG_IN_CACHE, &*self.state.in_cache);
        true
    }

    /// Tear down the VIP's region: unmap, close, then unlink the object.
    /// Idempotent across retries; anonymous test regions just drop.
    pub fn destroy(self) -> Result<()> {
        let name = self.region.name().map(str::to_owned);
        drop(self.region);
        if let Some(name) = name {
            let c_name = CString::new(name.as_str())?;
            if unsafe { libc::shm_unlink(c_name.as_ptr()) } < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    bail!("shm_unlink {name}: {err}");
                }
            }
            info!("shared region {name} destroyed");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Consumer endpoint
// ---------------------------------------------------------------------------

/// The external consumer's side of the region: reads outbound telemetry
/// frames, writes inbound weight frames. Lives in another process in
/// production; tests run it over a shared anonymous region.
pub struct ConsumerEndpoint {
    region: ShmRegion,
    last_out: u32,
    seq_in: u32,
}

impl ConsumerEndpoint {
    pub fn attach(vip_id: u32, size: usize) -> Result<Self> {
        let region = ShmRegion::attach(&vip_shm_name(vip_id), size)?;
        Ok(Self::with_region(region))
    }

    pub fn with_region(region: ShmRegion) -> Self {
        Self {
            region,
            last_out: 0,
            seq_in: 0,
        }
    }

    /// Number of active backends advertised in the region header.
    pub fn n_as(&self) -> u8 {
        self.region.read_block(SHM_OFFSET + layout::N_AS)
    }

    /// Accept the newest outbound frame with an id strictly greater than the
    /// last accepted one. Torn frames are discarded; ids only move forward.
    pub fn read_latest(&mut self) -> Option<MsgOut> {
        let mut best: Option<(u32, usize)> = None;
        for k in 0..FRAME_COUNT {
            let off = SHM_OFFSET + layout::msg_out_frame(k);
            let id = self.region.read_u32(off);
            if id_newer(id, self.last_out) && best.map_or(true, |(b, _)| id_newer(id, b)) {
                best = Some((id, off));
            }
        }
        let (id, off) = best?;
        let frame = read_sealed::<MsgOut>(&self.region, off, id)?;
        self.last_out = id;
        Some(frame)
    }

    /// Publish a weight frame to the data plane, sealed by the next sequence.
    pub fn write_weights(&mut self, now: f32, score: [f32; AS_MAX], weights: [AliasEntry; AS_MAX]) -> u32 {
        self.seq_in = self.seq_in.wrapping_add(1);
        let frame = MsgIn {
            id: 0,
            ts: now,
            score,
            weights,
        };
        let off = SHM_OFFSET + layout::msg_in_frame((self.seq_in & FRAME_MASK) as usize);
        write_sealed(&mut self.region, off, &frame, self.seq_in);
        self.seq_in
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: usize = 1_048_576;

    fn pair() -> (VipShm, ConsumerEndpoint) {
        let region = ShmRegion::anonymous(SIZE);
        let view = region.share().unwrap();
        let shm = VipShm::with_region(region).unwrap();
        (shm, ConsumerEndpoint::with_region(view))
    }

    #[test]
    fn test_region_too_small() {
        let region = ShmRegion::anonymous(4096);
        assert!(VipShm::with_region(region).is_err());
    }

    #[test]
    fn test_publish_and_read_roundtrip() {
        let (mut shm, mut consumer) = pair();
        shm.register_as(0).unwrap();
        shm.register_as(3).unwrap();
        shm.state_mut().stat_mut(3).n_packet = 77;

        assert!(consumer.read_latest().is_none(), "nothing sealed yet");
        shm.publish(0.1);
        let frame = consumer.read_latest().expect("sealed frame");
        assert_eq!(frame.id, 1);
        assert_eq!(frame.ts, 0.1);
        assert!(frame.active & 1 != 0 && frame.active & (1 << 3) != 0);
        assert_eq!(frame.body[3].n_packet, 77);
        assert_eq!(frame.body[3].as_index, 3);
        assert_eq!(consumer.n_as(), AS_MAX as u8);
    }

    #[test]
    fn test_reader_ids_strictly_increase() {
        let (mut shm, mut consumer) = pair();
        let mut seen = Vec::new();
        for tick in 0..10 {
            shm.publish(tick as f32 * 0.1);
            if let Some(frame) = consumer.read_latest() {
                seen.push(frame.id);
            }
            // A second read without a new publish yields nothing.
            assert!(consumer.read_latest().is_none());
        }
        assert_eq!(seen.len(), 10);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_reader_skips_to_newest() {
        let (mut shm, mut consumer) = pair();
        for tick in 0..7 {
            shm.publish(tick as f32);
        }
        // Only FRAME_COUNT frames survive; the reader lands on the newest.
        let frame = consumer.read_latest().expect("frame");
        assert_eq!(frame.id, 7);
    }

    #[test]
    fn test_weights_roundtrip() {
        let (mut shm, mut consumer) = pair();
        let mut score = [0.0f32; AS_MAX];
        score[2] = 0.75;
        let mut weights = [AliasEntry::default(); AS_MAX];
        weights[0] = AliasEntry { odd: 0.25, alias: 2 };

        assert!(!shm.fetch_weights(), "no inbound frame yet");
        consumer.write_weights(1.0, score, weights);
        assert!(shm.fetch_weights());
        let cache = &shm.state().in_cache;
        assert_eq!(cache.id, 1);
        assert_eq!(cache.score[2], 0.75);
        assert_eq!(cache.weights[0], AliasEntry { odd: 0.25, alias: 2 });

        // Stale fetch: nothing newer than the accepted id.
        assert!(!shm.fetch_weights());

        // Two more frames; the data plane takes the newest in one fetch.
        consumer.write_weights(2.0, score, weights);
        consumer.write_weights(3.0, score, weights);
        assert!(shm.fetch_weights());
        assert_eq!(shm.state().in_cache.id, 3);
    }

    #[test]
    fn test_register_and_remove_as() {
        let (mut shm, _consumer) = pair();
        shm.register_as(5).unwrap();
        assert!(shm.state().out_cache.is_active(5));
        assert_eq!(shm.state().in_cache.score[5], 1.0);

        shm.state_mut().stat_mut(5).n_flow = 12;
        shm.remove_as(5).unwrap();
        assert!(!shm.state().out_cache.is_active(5));
        assert_eq!(shm.state().stat(5).n_flow, 0);
        assert_eq!(shm.state().in_cache.score[5], 0.0);

        assert!(shm.register_as(64).is_err());
    }

    #[test]
    fn test_frames_wrap_ring() {
        let (mut shm, mut consumer) = pair();
        let mut last = 0;
        for tick in 0..25 {
            let id = shm.publish(tick as f32);
            assert_eq!(id, tick + 1);
            let frame = consumer.read_latest().expect("frame");
            assert!(frame.id > last);
            last = frame.id;
        }
        assert_eq!(last, 25);
    }

    /// End-to-end over a real POSIX object, when /dev/shm is usable.
    #[test]
    fn test_posix_lifecycle() {
        let vip_id = 0xF10C;
        let _ = unlink_vip(vip_id);
        let shm = match VipShm::create(vip_id, SIZE) {
            Ok(s) => s,
            // Environments without a usable /dev/shm skip the POSIX path.
            Err(_) => return,
        };
        let mut consumer = ConsumerEndpoint::attach(vip_id, SIZE).unwrap();
        let mut shm = shm;
        shm.register_as(1).unwrap();
        shm.publish(0.5);
        let frame = consumer.read_latest().expect("frame over real shm");
        assert_eq!(frame.id, 1);
        shm.destroy().unwrap();
        // Teardown is idempotent.
        unlink_vip(vip_id).unwrap();
    }
}
