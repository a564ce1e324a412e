//! Period-specialized kernel source.
//!
//! ProgPoW re-randomizes the inner-loop math every period. The
//! sequence is drawn from a kiss99 stream seeded by the period number,
//! and rendered here as CUDA source text: the generated
//! `progpow_loop` body is prepended to the fixed runtime kernel and the
//! pair is JIT-compiled by the device backend.

use crate::{PROGPOW_CNT_CACHE, PROGPOW_CNT_MATH, PROGPOW_PERIOD, PROGPOW_REGS};
use std::fmt::Write;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// KISS99 PRNG, the ProgPoW sequence generator. Period-seeded streams
/// must match the generator baked into the kernel, so this stays in
/// lock-step with the `.cu` text.
#[derive(Debug, Clone)]
pub struct Kiss99 {
    pub z: u32,
    pub w: u32,
    pub jsr: u32,
    pub jcong: u32,
}

impl Kiss99 {
    pub fn from_seed(seed: u64) -> Self {
        let lo = seed as u32;
        let hi = (seed >> 32) as u32;
        let z = fnv1a(FNV_OFFSET_BASIS, lo);
        let w = fnv1a(z, hi);
        let jsr = fnv1a(w, lo);
        let jcong = fnv1a(jsr, hi);
        Self { z, w, jsr, jcong }
    }

    pub fn next(&mut self) -> u32 {
        self.z = 36969u32
            .wrapping_mul(self.z & 65535)
            .wrapping_add(self.z >> 16);
        self.w = 18000u32
            .wrapping_mul(self.w & 65535)
            .wrapping_add(self.w >> 16);
        let mwc = (self.z << 16).wrapping_add(self.w);
        self.jsr ^= self.jsr << 17;
        self.jsr ^= self.jsr >> 13;
        self.jsr ^= self.jsr << 5;
        self.jcong = 69069u32.wrapping_mul(self.jcong).wrapping_add(1234567);
        (mwc ^ self.jcong).wrapping_add(self.jsr)
    }
}

fn fnv1a(h: u32, d: u32) -> u32 {
    (h ^ d).wrapping_mul(FNV_PRIME)
}

/// Fisher-Yates shuffled register sequence; guarantees every mix
/// register is a destination exactly once per pass.
fn register_sequence(rnd: &mut Kiss99) -> Vec<u32> {
    let mut seq: Vec<u32> = (0..PROGPOW_REGS).collect();
    for i in (1..seq.len()).rev() {
        let j = rnd.next() as usize % (i + 1);
        seq.swap(i, j);
    }
    seq
}

/// Render one randomized math op as CUDA source.
fn math_expr(a: &str, b: &str, sel: u32) -> String {
    match sel % 11 {
        0 => format!("{} + {}", a, b),
        1 => format!("{} * {}", a, b),
        2 => format!("__umulhi({}, {})", a, b),
        3 => format!("min({}, {})", a, b),
        4 => format!("rotl32({}, {})", a, b),
        5 => format!("rotr32({}, {})", a, b),
        6 => format!("{} & {}", a, b),
        7 => format!("{} | {}", a, b),
        8 => format!("{} ^ {}", a, b),
        9 => format!("clz({}) + clz({})", a, b),
        _ => format!("popcount({}) + popcount({})", a, b),
    }
}

/// Render the merge of a value into a mix register.
fn merge_stmt(dst: &str, src: &str, sel: u32) -> String {
    match sel % 4 {
        0 => format!("{d} = ({d} * 33) + {s};", d = dst, s = src),
        1 => format!("{d} = ({d} ^ {s}) * 33;", d = dst, s = src),
        2 => format!(
            "{d} = rotl32({d}, {r}) ^ {s};",
            d = dst,
            s = src,
            r = ((sel >> 16) % 31) + 1
        ),
        _ => format!(
            "{d} = rotr32({d}, {r}) ^ {s};",
            d = dst,
            s = src,
            r = ((sel >> 16) % 31) + 1
        ),
    }
}

/// Generate the period-specialized `progpow_loop` source for a block
/// height. Equal periods produce byte-identical source.
pub fn kernel_source(height: u64) -> String {
    let period = height / PROGPOW_PERIOD;
    let mut rnd = Kiss99::from_seed(period);

    let mut dst_seq = register_sequence(&mut rnd);
    let mut src_seq = register_sequence(&mut rnd);
    let mut dst_i = 0usize;
    let mut src_i = 0usize;
    let mut pick_dst = |rnd: &mut Kiss99| {
        if dst_i == dst_seq.len() {
            dst_seq = register_sequence(rnd);
            dst_i = 0;
        }
        let r = dst_seq[dst_i];
        dst_i += 1;
        r
    };
    let mut pick_src = |rnd: &mut Kiss99| {
        if src_i == src_seq.len() {
            src_seq = register_sequence(rnd);
            src_i = 0;
        }
        let r = src_seq[src_i];
        src_i += 1;
        r
    };

    let mut out = String::with_capacity(8 * 1024);
    let _ = writeln!(out, "// progpow period {}", period);
    // The period source leads the translation unit, so it carries the
    // shared types and helpers; the runtime half skips its own copies
    // when PROGPOW_HELPERS is set.
    out.push_str(concat!(
        "#define PROGPOW_HELPERS 1\n",
        "#define PROGPOW_LANES 16\n",
        "#define PROGPOW_REGS 32\n",
        "#define PROGPOW_DAG_LOADS 4\n",
        "#define PROGPOW_CACHE_WORDS 4096\n",
        "#define PROGPOW_CNT_DAG 64\n",
        "typedef struct __align__(16) { uint32_t s[PROGPOW_DAG_LOADS]; } dag_t;\n",
        "__device__ __forceinline__ uint32_t rotl32(uint32_t x, uint32_t n) { return __funnelshift_l(x, x, n); }\n",
        "__device__ __forceinline__ uint32_t rotr32(uint32_t x, uint32_t n) { return __funnelshift_r(x, x, n); }\n",
        "__device__ __forceinline__ uint32_t clz(uint32_t x) { return __clz(x); }\n",
        "__device__ __forceinline__ uint32_t popcount(uint32_t x) { return __popc(x); }\n",
    ));
    let _ = writeln!(
        out,
        "__device__ __forceinline__ void progpow_loop(const uint32_t loop_idx, uint32_t mix[PROGPOW_REGS], const dag_t *g_dag, const uint32_t c_dag[PROGPOW_CACHE_WORDS], const uint32_t lane_id)"
    );
    let _ = writeln!(out, "{{");
    let _ = writeln!(
        out,
        "    const uint32_t item_idx = mix[loop_idx % PROGPOW_REGS] % PROGPOW_DAG_ELEMENTS;"
    );
    let _ = writeln!(
        out,
        "    dag_t dag_entry = g_dag[item_idx * PROGPOW_LANES + lane_id];"
    );

    // Interleave the cache accesses and the random math, cache-first,
    // matching the fixed per-period instruction counts.
    let total = PROGPOW_CNT_CACHE.max(PROGPOW_CNT_MATH);
    for i in 0..total {
        if i < PROGPOW_CNT_CACHE {
            let src = pick_src(&mut rnd);
            let dst = pick_dst(&mut rnd);
            let sel = rnd.next();
            let _ = writeln!(
                out,
                "    {{ uint32_t offset = mix[{}] % PROGPOW_CACHE_WORDS;",
                src
            );
            let _ = writeln!(
                out,
                "      {} }}",
                merge_stmt(&format!("mix[{}]", dst), "c_dag[offset]", sel)
            );
        }
        if i < PROGPOW_CNT_MATH {
            let a = pick_src(&mut rnd);
            let b = pick_src(&mut rnd);
            let dst = pick_dst(&mut rnd);
            let sel_math = rnd.next();
            let sel_merge = rnd.next();
            let expr = math_expr(
                &format!("mix[{}]", a),
                &format!("mix[{}]", b),
                sel_math,
            );
            let _ = writeln!(
                out,
                "    {{ uint32_t data = {}; {} }}",
                expr,
                merge_stmt(&format!("mix[{}]", dst), "data", sel_merge)
            );
        }
    }

    // Fold the fetched DAG lanes back into the mix.
    for l in 0..(crate::PROGPOW_DAG_LOADS) {
        let dst = pick_dst(&mut rnd);
        let sel = rnd.next();
        let _ = writeln!(
            out,
            "    {}",
            merge_stmt(
                &format!("mix[{}]", dst),
                &format!("dag_entry.s[{}]", l),
                sel
            )
        );
    }

    let _ = writeln!(out, "}}");
    out
}

/// The fixed runtime kernel text the period source is prepended to.
/// Embedded at build time; never read from disk.
pub fn runtime_source() -> &'static str {
    include_str!("kernels/progpow.cu")
}
