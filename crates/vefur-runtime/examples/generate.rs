//! Runs the decode loop on a synthetic checkpoint and prints the result.
//!
//! Defaults to the CPU device; set `VEFUR_DEVICE=gpu` to run on the first
//! available adapter.

use ndarray::array;

use vefur_runtime::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = DecoderConfig {
        vocab_size: 512,
        hidden_size: 64,
        num_layers: 2,
        num_heads: 4,
        inner_size: 128,
        max_batch_size: 1,
        max_step: 32,
        beam_width: 1,
        padding_id: 0,
        eos_id: 1,
        norm_kind: vefur_runtime::ops::NormKind::LayerNorm,
        norm_eps: 1e-5,
        decoding: DecodingKind::Sampling {
            temperature: 0.8,
            top_k: Some(50),
            top_p: Some(0.9),
        },
    };
    let table = ParamTable::synthetic(&config, 42)?;

    let ctx = match std::env::var("VEFUR_DEVICE").as_deref() {
        Ok("gpu") => GraphContext::for_gpu(WgpuContext::new().await?),
        _ => GraphContext::for_cpu(),
    };

    let mut model = DecoderModel::build(ctx, config, &table)?;
    model.set_input_tokens(0, &array![[45u32, 90, 12, 7]])?;
    model.infer().await?;

    let shape = model.output_shape(0)?;
    let tokens = model.read_output_tokens().await?;
    let scores = model.read_output_scores().await?;

    println!("output shape: {shape:?}");
    println!("tokens: {:?}", tokens.row(0).to_vec());
    println!("score:  {:.4}", scores[0]);
    Ok(())
}
