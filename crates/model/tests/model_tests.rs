use std::sync::{Arc, Barrier, Mutex};

use anyhow::{anyhow, Result};
use attention::core::SdpaBackend;
use attention::masks::decoder_mask_from_padding;
use attention::{CacheLayout, Capabilities, KvCache};
use candle_core::{DType, Device, Tensor, D};
use layers::linear::WeightLayout;
use layers::quant::QuantizedLinear;
use model::{
    Architecture, DecoderBlock, ModelConfig, ModelInput, OptimizedModel, ProcessGroup, QuantMode,
    SourceBlock, SourceLinear, SourceNorm, TensorParallel, TransformerConfig,
};
use static_assertions::assert_impl_all;

assert_impl_all!(OptimizedModel: Send, Sync);
assert_impl_all!(DecoderBlock: Send, Sync);
assert_impl_all!(TensorParallel: Send, Sync, Clone);
assert_impl_all!(SourceBlock: Send, Sync, Clone);

const HIDDEN: usize = 32;
const INTER: usize = 64;
const HEADS: usize = 4;

fn model_config(arch: Architecture, layers: usize) -> Result<ModelConfig> {
    let json = match arch {
        Architecture::GptJ => format!(
            r#"{{"model_type": "gptj", "n_embd": {HIDDEN}, "n_inner": {INTER}, "n_head": {HEADS},
                "n_layer": {layers}, "rotary_dim": 4, "activation_function": "gelu_new"}}"#
        ),
        _ => format!(
            r#"{{"model_type": "{}", "hidden_size": {HIDDEN}, "intermediate_size": {INTER},
                "num_attention_heads": {HEADS}, "num_key_value_heads": 2,
                "num_hidden_layers": {layers}, "hidden_act": "silu"}}"#,
            arch.tag()
        ),
    };
    Ok(ModelConfig::from_json(&json)?)
}

fn config(arch: Architecture, layers: usize) -> Result<TransformerConfig> {
    let source = model_config(arch, layers)?;
    Ok(TransformerConfig::build(
        arch,
        &source,
        "fp32",
        &Device::Cpu,
        TensorParallel::single(),
    )?)
}

fn dense(out: usize, inp: usize, bias: bool) -> Result<Option<SourceLinear>> {
    let device = Device::Cpu;
    let weight = Tensor::randn(0f32, 0.15, (out, inp), &device)?;
    let bias = if bias {
        Some(Tensor::randn(0f32, 0.05, out, &device)?)
    } else {
        None
    };
    Ok(Some(SourceLinear::dense(weight, bias)))
}

fn norm(bias: bool) -> Result<SourceNorm> {
    let device = Device::Cpu;
    Ok(SourceNorm {
        weight: Some((Tensor::randn(0f32, 0.1, HIDDEN, &device)? + 1.0)?),
        bias: if bias {
            Some(Tensor::randn(0f32, 0.05, HIDDEN, &device)?)
        } else {
            None
        },
    })
}

fn sources(cfg: &TransformerConfig) -> Result<Vec<SourceBlock>> {
    let kv = cfg.num_key_value_head * cfg.head_dim;
    let gptj = cfg.architecture == Architecture::GptJ;
    (0..cfg.num_layers)
        .map(|_| {
            let mut block = SourceBlock {
                input_layernorm: norm(gptj)?,
                ..SourceBlock::default()
            };
            if !gptj {
                block.post_attention_layernorm = norm(false)?;
                block.mlp.gate_proj = dense(INTER, HIDDEN, false)?;
            }
            block.self_attn.q_proj = dense(HIDDEN, HIDDEN, cfg.architecture.qkv_bias())?;
            block.self_attn.k_proj = dense(kv, HIDDEN, cfg.architecture.qkv_bias())?;
            block.self_attn.v_proj = dense(kv, HIDDEN, cfg.architecture.qkv_bias())?;
            block.self_attn.o_proj = dense(HIDDEN, HIDDEN, false)?;
            block.mlp.up_proj = dense(INTER, HIDDEN, gptj)?;
            block.mlp.down_proj = dense(HIDDEN, INTER, gptj)?;
            Ok(block)
        })
        .collect()
}

fn build(
    cfg: &TransformerConfig,
    sources: &[SourceBlock],
    capabilities: Capabilities,
) -> Result<OptimizedModel> {
    let mut sources = sources.to_vec();
    Ok(OptimizedModel::with_capabilities(
        cfg.clone(),
        &mut sources,
        capabilities,
    )?)
}

fn input<'a>(
    hidden: &'a Tensor,
    positions: &'a Tensor,
    past: Option<Vec<KvCache>>,
    beam: usize,
) -> ModelInput<'a> {
    ModelInput {
        hidden,
        attention_mask: None,
        position_ids: positions,
        past_key_values: past,
        output_attentions: false,
        use_cache: true,
        beam,
    }
}

/// Prefill `prompt`, then decode one token per entry of `steps`.
fn generate(
    model: &mut OptimizedModel,
    prompt: &Tensor,
    steps: &[Tensor],
    beam: usize,
) -> Result<(Vec<Tensor>, Vec<KvCache>)> {
    let device = Device::Cpu;
    let seq = prompt.dim(1)?;
    let positions = Tensor::arange(0u32, seq as u32, &device)?;
    let out = model.forward(input(prompt, &positions, None, beam))?;
    let mut outputs = vec![out.hidden];
    let mut past = out.past_key_values;
    for (i, step) in steps.iter().enumerate() {
        let pos = Tensor::new(&[(seq + i) as u32], &device)?;
        let out = model.forward(input(step, &pos, past.take(), beam))?;
        outputs.push(out.hidden);
        past = out.past_key_values;
    }
    Ok((outputs, past.ok_or_else(|| anyhow!("cache was not returned"))?))
}

fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok(a.to_dtype(DType::F32)?
        .sub(&b.to_dtype(DType::F32)?)?
        .abs()?
        .max_all()?
        .to_vec0::<f32>()?)
}

fn decode_steps(rows: usize, count: usize) -> Result<Vec<Tensor>> {
    (0..count)
        .map(|_| Ok(Tensor::randn(0f32, 1.0, (rows, 1, HIDDEN), &Device::Cpu)?))
        .collect()
}

#[test]
fn first_token_beam_dedup_matches_per_beam_compute() -> Result<()> {
    let cfg = config(Architecture::Llama, 2)?;
    let src = sources(&cfg)?;
    let caps = Capabilities::detect(&Device::Cpu);
    let (batch, beam, seq) = (2, 2, 4);

    let prompts = Tensor::randn(0f32, 1.0, (batch, seq, HIDDEN), &Device::Cpu)?;
    let rows = prompts
        .unsqueeze(1)?
        .broadcast_as((batch, beam, seq, HIDDEN))?
        .reshape((batch * beam, seq, HIDDEN))?;
    let steps = decode_steps(batch * beam, 3)?;

    let mut deduped = build(&cfg, &src, caps)?;
    let mut independent = build(&cfg, &src, caps)?;
    let (out_a, cache_a) = generate(&mut deduped, &rows, &steps, beam)?;
    let (out_b, cache_b) = generate(&mut independent, &rows, &steps, 1)?;

    assert_eq!(out_a[0].dims(), &[batch * beam, seq, HIDDEN]);
    for (a, b) in out_a.iter().zip(&out_b) {
        assert!(max_diff(a, b)? < 1e-4);
    }
    for (a, b) in cache_a.iter().zip(&cache_b) {
        assert_eq!(a.rows(), batch * beam);
        assert_eq!(a.seq_len(), seq + steps.len());
        assert!(max_diff(&a.keys()?, &b.keys()?)? < 1e-4);
        assert!(max_diff(&a.values()?, &b.values()?)? < 1e-4);
    }
    Ok(())
}

#[test]
fn first_token_attention_weights_cover_every_beam() -> Result<()> {
    let cfg = config(Architecture::Mistral, 2)?;
    let src = sources(&cfg)?;
    let mut model = build(&cfg, &src, Capabilities::detect(&Device::Cpu))?;
    let prompt = Tensor::randn(0f32, 1.0, (1, 3, HIDDEN), &Device::Cpu)?.repeat((3, 1, 1))?;
    let positions = Tensor::arange(0u32, 3, &Device::Cpu)?;
    let out = model.forward(ModelInput {
        output_attentions: true,
        use_cache: false,
        ..input(&prompt, &positions, None, 3)
    })?;
    assert_eq!(out.attentions.len(), 2);
    assert_eq!(out.attentions[0].dims(), &[3, HEADS, 3, 3]);
    assert!(out.past_key_values.is_none());
    let sums = out.attentions[1].sum(D::Minus1)?;
    assert!(max_diff(&sums, &Tensor::ones_like(&sums)?)? < 1e-5);
    Ok(())
}

#[test]
fn every_resolved_strategy_decodes_identically() -> Result<()> {
    let cfg = config(Architecture::Qwen2, 2)?;
    let src = sources(&cfg)?;
    let prompt = Tensor::randn(0f32, 1.0, (2, 5, HIDDEN), &Device::Cpu)?;
    let steps = decode_steps(2, 3)?;

    let mut baseline = build(&cfg, &src, Capabilities::default())?;
    let (expected, _) = generate(&mut baseline, &prompt, &steps, 1)?;

    for sdpa in [SdpaBackend::Naive, SdpaBackend::Fused] {
        for weight_layout in [WeightLayout::OutputMajor, WeightLayout::InputMajor] {
            for cache_layout in [CacheLayout::BatchMajor, CacheLayout::SeqMajor] {
                for fused_residual in [false, true] {
                    let caps = Capabilities {
                        sdpa,
                        weight_layout,
                        cache_layout,
                        fused_residual,
                    };
                    let mut model = build(&cfg, &src, caps)?;
                    assert!(model.blocks().iter().all(|b| b.attention().is_qkv_fused()));
                    let (outputs, caches) = generate(&mut model, &prompt, &steps, 1)?;
                    assert_eq!(caches[0].layout(), cache_layout);
                    for (got, want) in outputs.iter().zip(&expected) {
                        let diff = max_diff(got, want)?;
                        assert!(diff < 1e-4, "{caps:?}: diff {diff}");
                    }
                }
            }
        }
    }
    Ok(())
}

#[test]
fn packed_qkv_matches_separate_projections() -> Result<()> {
    let cfg = config(Architecture::Llama, 1)?;
    let src = sources(&cfg)?;
    let mut packed_cfg = cfg.clone();
    packed_cfg.architecture = Architecture::Baichuan;
    let packed_src = src
        .iter()
        .map(|block| {
            let mut block = block.clone();
            let attn = &mut block.self_attn;
            let weights = [attn.q_proj.take(), attn.k_proj.take(), attn.v_proj.take()]
                .into_iter()
                .map(|slot| match slot {
                    Some(SourceLinear::Dense { weight, .. }) => Ok(weight),
                    _ => Err(anyhow!("expected a dense projection")),
                })
                .collect::<Result<Vec<_>>>()?;
            attn.w_pack = Some(SourceLinear::dense(Tensor::cat(&weights, 0)?, None));
            Ok(block)
        })
        .collect::<Result<Vec<_>>>()?;

    let prompt = Tensor::randn(0f32, 1.0, (1, 4, HIDDEN), &Device::Cpu)?;
    let steps = decode_steps(1, 2)?;
    let caps = Capabilities::detect(&Device::Cpu);
    let (a, _) = generate(&mut build(&cfg, &src, caps)?, &prompt, &steps, 1)?;
    let (b, _) = generate(&mut build(&packed_cfg, &packed_src, caps)?, &prompt, &steps, 1)?;
    for (a, b) in a.iter().zip(&b) {
        assert!(max_diff(a, b)? < 1e-5);
    }
    Ok(())
}

#[test]
fn int4_blocks_match_their_dequantized_weights() -> Result<()> {
    let mut cfg = config(Architecture::Llama, 2)?;
    let src = sources(&cfg)?;
    let group_size = 16;
    let quantize = |slot: &mut Option<SourceLinear>| -> Result<()> {
        if let Some(SourceLinear::Dense { weight, bias }) = slot.take() {
            *slot = Some(QuantizedLinear::quantize(&weight, bias, group_size)?.into());
        }
        Ok(())
    };
    let mut quantized_src = src.clone();
    for block in &mut quantized_src {
        let attn = &mut block.self_attn;
        for slot in [&mut attn.q_proj, &mut attn.k_proj, &mut attn.v_proj, &mut attn.o_proj] {
            quantize(slot)?;
        }
        let mlp = &mut block.mlp;
        for slot in [&mut mlp.gate_proj, &mut mlp.up_proj, &mut mlp.down_proj] {
            quantize(slot)?;
        }
    }

    let prompt = Tensor::randn(0f32, 1.0, (2, 3, HIDDEN), &Device::Cpu)?;
    let steps = decode_steps(2, 2)?;
    for weight_layout in [WeightLayout::OutputMajor, WeightLayout::InputMajor] {
        let caps = Capabilities {
            weight_layout,
            ..Capabilities::default()
        };
        cfg.quant = QuantMode::None;
        let mut model = build(&cfg, &quantized_src, caps)?;
        let (dequantized, _) = generate(&mut model, &prompt, &steps, 1)?;

        cfg.quant = QuantMode::Int4 { group_size };
        let (packed, _) = generate(&mut build(&cfg, &quantized_src, caps)?, &prompt, &steps, 1)?;
        let (from_dense, _) = generate(&mut build(&cfg, &src, caps)?, &prompt, &steps, 1)?;
        for ((q, d), f) in packed.iter().zip(&dequantized).zip(&from_dense) {
            assert!(max_diff(q, d)? < 1e-4);
            assert!(max_diff(q, f)? < 1e-5);
        }
    }
    Ok(())
}

#[test]
fn reorder_cache_follows_selected_beams() -> Result<()> {
    let cfg = config(Architecture::Phi3, 2)?;
    let src = sources(&cfg)?;
    let mut model = build(&cfg, &src, Capabilities::detect(&Device::Cpu))?;
    let prompt = Tensor::randn(0f32, 1.0, (1, 3, HIDDEN), &Device::Cpu)?.repeat((2, 1, 1))?;
    let steps = decode_steps(2, 1)?;
    let (_, mut caches) = generate(&mut model, &prompt, &steps, 2)?;
    let before: Vec<Tensor> = caches.iter().map(|c| c.keys()).collect::<candle_core::Result<_>>()?;

    let indices = Tensor::new(&[1u32, 1], &Device::Cpu)?;
    OptimizedModel::reorder_cache(&mut caches, &indices)?;
    for (cache, old) in caches.iter().zip(&before) {
        let keys = cache.keys()?;
        assert_eq!(max_diff(&keys.get(0)?, &old.get(1)?)?, 0.0);
        assert_eq!(max_diff(&keys.get(1)?, &old.get(1)?)?, 0.0);
    }
    let out_of_range = Tensor::new(&[2u32, 0], &Device::Cpu)?;
    assert!(OptimizedModel::reorder_cache(&mut caches, &out_of_range).is_err());
    Ok(())
}

/// Prefill and decode under a left-padding keep mask (`1` keep, `0` pad).
fn generate_padded(
    model: &mut OptimizedModel,
    prompt: &Tensor,
    keep: &Tensor,
    steps: &[Tensor],
    beam: usize,
) -> Result<Vec<Tensor>> {
    let device = Device::Cpu;
    let (rows, seq, _) = prompt.dims3()?;
    let positions = Tensor::arange(0u32, seq as u32, &device)?;
    let mask = decoder_mask_from_padding(keep, seq)?;
    let out = model.forward(ModelInput {
        attention_mask: Some(&mask),
        ..input(prompt, &positions, None, beam)
    })?;
    let mut outputs = vec![out.hidden];
    let mut past = out.past_key_values;
    let mut keep = keep.clone();
    for (i, step) in steps.iter().enumerate() {
        keep = Tensor::cat(&[&keep, &Tensor::ones((rows, 1), DType::U8, &device)?], 1)?;
        let mask = decoder_mask_from_padding(&keep, 1)?;
        let pos = Tensor::new(&[(seq + i) as u32], &device)?;
        let out = model.forward(ModelInput {
            attention_mask: Some(&mask),
            ..input(step, &pos, past.take(), beam)
        })?;
        outputs.push(out.hidden);
        past = out.past_key_values;
    }
    Ok(outputs)
}

fn nan_count(x: &Tensor) -> Result<usize> {
    Ok(x.flatten_all()?
        .to_vec1::<f32>()?
        .iter()
        .filter(|v| !v.is_finite())
        .count())
}

#[test]
fn left_padding_decodes_identically_under_both_kernels() -> Result<()> {
    let cfg = config(Architecture::Llama, 2)?;
    let src = sources(&cfg)?;
    let keep = Tensor::new(&[[0u8, 1, 1, 1], [1, 1, 1, 1]], &Device::Cpu)?;
    let prompt = Tensor::randn(0f32, 1.0, (2, 4, HIDDEN), &Device::Cpu)?;
    let steps = decode_steps(2, 2)?;

    let mut outputs = Vec::new();
    for sdpa in [SdpaBackend::Naive, SdpaBackend::Fused] {
        let caps = Capabilities {
            sdpa,
            ..Capabilities::default()
        };
        let mut model = build(&cfg, &src, caps)?;
        outputs.push(generate_padded(&mut model, &prompt, &keep, &steps, 1)?);
    }
    for (naive, fused) in outputs[0].iter().zip(&outputs[1]) {
        assert_eq!(nan_count(naive)?, 0);
        assert_eq!(nan_count(fused)?, 0);
        assert!(max_diff(naive, fused)? < 1e-4);
    }

    // The unpadded row is unaffected by its neighbour's padding.
    let mut model = build(&cfg, &src, Capabilities::default())?;
    let alone = generate(&mut model, &prompt.narrow(0, 1, 1)?, &[], 1)?.0;
    assert!(max_diff(&outputs[1][0].narrow(0, 1, 1)?, &alone[0])? < 1e-4);
    Ok(())
}

#[test]
fn padded_beams_dedup_with_their_mask() -> Result<()> {
    let cfg = config(Architecture::Mistral, 2)?;
    let src = sources(&cfg)?;
    let (batch, beam, seq) = (2, 2, 4);
    let prompts = Tensor::randn(0f32, 1.0, (batch, seq, HIDDEN), &Device::Cpu)?;
    let rows = prompts
        .unsqueeze(1)?
        .broadcast_as((batch, beam, seq, HIDDEN))?
        .reshape((batch * beam, seq, HIDDEN))?;
    // Beams of one batch entry share its padding.
    let keep = Tensor::new(
        &[[0u8, 0, 1, 1], [0, 0, 1, 1], [1, 1, 1, 1], [1, 1, 1, 1]],
        &Device::Cpu,
    )?;
    let steps = decode_steps(batch * beam, 2)?;

    for sdpa in [SdpaBackend::Naive, SdpaBackend::Fused] {
        let caps = Capabilities {
            sdpa,
            ..Capabilities::default()
        };
        let deduped = generate_padded(&mut build(&cfg, &src, caps)?, &rows, &keep, &steps, beam)?;
        let independent = generate_padded(&mut build(&cfg, &src, caps)?, &rows, &keep, &steps, 1)?;
        assert_eq!(deduped[0].dims(), &[batch * beam, seq, HIDDEN]);
        for (a, b) in deduped.iter().zip(&independent) {
            assert_eq!(nan_count(a)?, 0);
            assert!(max_diff(a, b)? < 1e-4, "{sdpa:?}");
        }
    }
    Ok(())
}

fn manual_layer_norm(x: &Tensor, norm: &SourceNorm, eps: f64) -> Result<Tensor> {
    let weight = norm.weight.as_ref().ok_or_else(|| anyhow!("norm weight"))?;
    let bias = norm.bias.as_ref().ok_or_else(|| anyhow!("norm bias"))?;
    let mean = x.mean_keepdim(D::Minus1)?;
    let centered = x.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
    Ok(centered
        .broadcast_div(&(var + eps)?.sqrt()?)?
        .broadcast_mul(weight)?
        .broadcast_add(bias)?)
}

fn manual_linear(x: &Tensor, slot: &Option<SourceLinear>) -> Result<Tensor> {
    match slot {
        Some(SourceLinear::Dense { weight, bias }) => {
            let out = x.broadcast_matmul(&weight.t()?)?;
            Ok(match bias {
                Some(bias) => out.broadcast_add(bias)?,
                None => out,
            })
        }
        _ => Err(anyhow!("expected a dense projection")),
    }
}

fn zeroed(slot: &mut Option<SourceLinear>) -> Result<()> {
    if let Some(SourceLinear::Dense { weight, bias }) = slot {
        *weight = weight.zeros_like()?;
        if let Some(bias) = bias {
            *bias = bias.zeros_like()?;
        }
    }
    Ok(())
}

#[test]
fn parallel_residual_sums_independent_branches() -> Result<()> {
    let cfg = config(Architecture::GptJ, 1)?;
    let src = sources(&cfg)?;
    let mut attn_only = src.clone();
    zeroed(&mut attn_only[0].mlp.down_proj)?;
    let mut mlp_only = src.clone();
    zeroed(&mut mlp_only[0].self_attn.o_proj)?;

    let x = Tensor::randn(0f32, 1.0, (2, 4, HIDDEN), &Device::Cpu)?;
    let caps = Capabilities::detect(&Device::Cpu);
    let (full, _) = generate(&mut build(&cfg, &src, caps)?, &x, &[], 1)?;
    let (attn, _) = generate(&mut build(&cfg, &attn_only, caps)?, &x, &[], 1)?;
    let (mlp, _) = generate(&mut build(&cfg, &mlp_only, caps)?, &x, &[], 1)?;

    let recombined = ((&attn[0] + &mlp[0])? - &x)?;
    assert!(max_diff(&full[0], &recombined)? < 1e-4);

    let block = &src[0];
    let normed = manual_layer_norm(&x, &block.input_layernorm, cfg.norm_eps)?;
    let inter = manual_linear(&normed, &block.mlp.up_proj)?.gelu()?;
    let expected = (manual_linear(&inter, &block.mlp.down_proj)? + &x)?;
    assert!(max_diff(&mlp[0], &expected)? < 1e-4);
    Ok(())
}

#[derive(Debug)]
struct Exchange {
    barrier: Barrier,
    slots: Mutex<Vec<Option<Tensor>>>,
}

/// In-process group whose ranks are threads meeting at a barrier.
#[derive(Debug)]
struct ThreadGroup {
    rank: usize,
    exchange: Arc<Exchange>,
}

impl ProcessGroup for ThreadGroup {
    fn size(&self) -> usize {
        2
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn all_reduce(&self, tensor: &Tensor) -> candle_core::Result<Tensor> {
        let poisoned = |_| candle_core::Error::Msg("all-reduce lock poisoned".into());
        self.exchange.slots.lock().map_err(poisoned)?[self.rank] = Some(tensor.clone());
        self.exchange.barrier.wait();
        let sum = {
            let slots = self.exchange.slots.lock().map_err(poisoned)?;
            let mut parts = slots.iter().flatten();
            let first = parts
                .next()
                .cloned()
                .ok_or_else(|| candle_core::Error::Msg("empty all-reduce".into()))?;
            parts.try_fold(first, |acc, t| acc.add(t))
        };
        self.exchange.barrier.wait();
        sum
    }
}

/// Slice output rows (column parallel) or input columns (row parallel) for `rank`.
fn shard_linear(
    slot: &Option<SourceLinear>,
    rank: usize,
    size: usize,
    column: bool,
) -> Result<Option<SourceLinear>> {
    match slot {
        Some(SourceLinear::Dense { weight, bias }) => {
            let axis = if column { 0 } else { 1 };
            let len = weight.dim(axis)? / size;
            let weight = weight.narrow(axis, rank * len, len)?.contiguous()?;
            let bias = match bias {
                Some(b) if column => Some(b.narrow(0, rank * len, len)?.contiguous()?),
                other => other.clone(),
            };
            Ok(Some(SourceLinear::dense(weight, bias)))
        }
        None => Ok(None),
        Some(SourceLinear::Quantized(_)) => Err(anyhow!("quantized sharding is not exercised")),
    }
}

fn shard(block: &SourceBlock, rank: usize, size: usize) -> Result<SourceBlock> {
    let mut out = SourceBlock {
        input_layernorm: block.input_layernorm.clone(),
        post_attention_layernorm: block.post_attention_layernorm.clone(),
        ..SourceBlock::default()
    };
    let (attn, mlp) = (&block.self_attn, &block.mlp);
    out.self_attn.q_proj = shard_linear(&attn.q_proj, rank, size, true)?;
    out.self_attn.k_proj = shard_linear(&attn.k_proj, rank, size, true)?;
    out.self_attn.v_proj = shard_linear(&attn.v_proj, rank, size, true)?;
    out.self_attn.o_proj = shard_linear(&attn.o_proj, rank, size, false)?;
    out.mlp.gate_proj = shard_linear(&mlp.gate_proj, rank, size, true)?;
    out.mlp.up_proj = shard_linear(&mlp.up_proj, rank, size, true)?;
    out.mlp.down_proj = shard_linear(&mlp.down_proj, rank, size, false)?;
    Ok(out)
}

fn tensor_parallel_matches_unsharded(arch: Architecture) -> Result<()> {
    let cfg = config(arch, 2)?;
    let src = sources(&cfg)?;
    let caps = Capabilities::detect(&Device::Cpu);
    let prompt = Tensor::randn(0f32, 1.0, (2, 4, HIDDEN), &Device::Cpu)?;
    let steps = decode_steps(2, 2)?;
    let (expected, _) = generate(&mut build(&cfg, &src, caps)?, &prompt, &steps, 1)?;

    let exchange = Arc::new(Exchange {
        barrier: Barrier::new(2),
        slots: Mutex::new(vec![None, None]),
    });
    let model_cfg = model_config(arch, 2)?;
    let per_rank = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                let group = ThreadGroup {
                    rank,
                    exchange: Arc::clone(&exchange),
                };
                let (src, model_cfg, prompt, steps) = (&src, &model_cfg, &prompt, &steps);
                scope.spawn(move || -> Result<Vec<Tensor>> {
                    let tp = TensorParallel::new(Arc::new(group))?;
                    let cfg = TransformerConfig::build(arch, model_cfg, "fp32", &Device::Cpu, tp)?;
                    let mut shards = src
                        .iter()
                        .map(|block| shard(block, rank, 2))
                        .collect::<Result<Vec<_>>>()?;
                    let mut model = OptimizedModel::with_capabilities(cfg, &mut shards, caps)?;
                    assert_eq!(model.config().attention_config().num_heads, HEADS / 2);
                    Ok(generate(&mut model, prompt, steps, 1)?.0)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().map_err(|_| anyhow!("rank panicked"))?)
            .collect::<Result<Vec<_>>>()
    })?;

    for outputs in &per_rank {
        for (got, want) in outputs.iter().zip(&expected) {
            assert!(max_diff(got, want)? < 1e-4);
        }
    }
    Ok(())
}

#[test]
fn tensor_parallel_llama_matches_unsharded() -> Result<()> {
    tensor_parallel_matches_unsharded(Architecture::Llama)
}

#[test]
fn tensor_parallel_gptj_matches_unsharded() -> Result<()> {
    tensor_parallel_matches_unsharded(Architecture::GptJ)
}

#[test]
fn sources_must_match_declared_layers() -> Result<()> {
    let cfg = config(Architecture::Llama, 2)?;
    let mut src = sources(&cfg)?;
    src.pop();
    let err = OptimizedModel::with_capabilities(cfg, &mut src, Capabilities::default());
    assert!(err.is_err());
    Ok(())
}
