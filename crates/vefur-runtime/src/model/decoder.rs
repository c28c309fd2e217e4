//! Autoregressive decoder model.
//!
//! Construction wires the whole layer pipeline exactly once inside the
//! build phase, sizing every buffer at (max batch x beam x max step).
//! Inference drives an explicit state machine (Prefill, Decode, Stopped)
//! over the already-wired graph: each iteration only adjusts per-step shape
//! scalars, and the single state-carrying mutation between iterations is
//! the buffer swap of the token ping-pong pair.

use ndarray::{Array1, Array2};

use crate::error::{Error, Result};
use crate::generation::SequenceState;
use crate::graph::{Graph, GraphContext, StepConfig, StepFrame, VarId};
use crate::layers::{
    DecoderLayer, EmbeddingLayer, FinalNormLayer, GeneratorLayer, Layer, ProjectionLayer,
};
use crate::model::config::DecoderConfig;
use crate::tensor::DType;
use crate::weights::ParamTable;

use crate::generation::DecodingStrategy;

/// Decode-loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    Prefill,
    Decode,
    Stopped,
}

pub struct DecoderModel {
    config: DecoderConfig,
    graph: Graph,

    embedding: EmbeddingLayer,
    blocks: Vec<DecoderLayer>,
    final_norm: FinalNormLayer,
    projection: ProjectionLayer,
    generator: GeneratorLayer,

    inp_tokens: VarId,
    beam_indices: VarId,

    prompt: Option<Vec<Vec<u32>>>,
    state: DecodeState,
    steps_taken: usize,
    forward_passes: usize,
    output_shape: Vec<usize>,
}

impl DecoderModel {
    /// Builds the model with the strategy named by the config.
    pub fn build(ctx: GraphContext, config: DecoderConfig, table: &ParamTable) -> Result<Self> {
        let strategy = config.strategy();
        Self::build_with_strategy(ctx, config, table, strategy)
    }

    /// Builds the model around an externally supplied decoding strategy.
    pub fn build_with_strategy(
        ctx: GraphContext,
        config: DecoderConfig,
        table: &ParamTable,
        strategy: Box<dyn DecodingStrategy>,
    ) -> Result<Self> {
        config.validate()?;
        let mut graph = Graph::new(ctx)?;

        let max_rows = config.max_rows();
        let max_step = config.max_step;
        let hidden = config.hidden_size;

        // Wiring: topology and worst-case capacities, fixed here once.
        let inp_tokens =
            graph.declare_allocated("inp_tokens", DType::U32, &[max_rows, max_step])?;
        let beam_indices = graph.declare_allocated("beam_indices", DType::U32, &[max_rows])?;

        let embedding = EmbeddingLayer::wire(
            &mut graph,
            "embedding",
            inp_tokens,
            config.vocab_size,
            hidden,
            max_rows,
            max_step,
        )?;

        let mut blocks = Vec::with_capacity(config.num_layers);
        let mut hidden_var = embedding.out();
        for i in 0..config.num_layers {
            let block = DecoderLayer::wire(
                &mut graph,
                &format!("block{i}"),
                hidden_var,
                hidden,
                config.num_heads,
                config.inner_size,
                config.norm_kind,
                config.norm_eps,
                max_rows,
                max_step,
            )?;
            hidden_var = block.out();
            blocks.push(block);
        }

        let final_norm = FinalNormLayer::wire(
            &mut graph,
            "final_norm",
            hidden_var,
            hidden,
            config.norm_kind,
            config.norm_eps,
            max_rows,
            max_step,
        )?;
        let projection = ProjectionLayer::wire(
            &mut graph,
            "projection",
            final_norm.out(),
            embedding.token_table(),
            hidden,
            config.vocab_size,
            max_rows,
            max_step,
        )?;
        let generator = GeneratorLayer::wire(
            &mut graph,
            "generator",
            projection.out(),
            strategy,
            config.padding_id,
            max_rows,
            max_step,
        )?;

        graph.finish_build()?;

        let mut model = Self {
            config,
            graph,
            embedding,
            blocks,
            final_norm,
            projection,
            generator,
            inp_tokens,
            beam_indices,
            prompt: None,
            state: DecodeState::Stopped,
            steps_taken: 0,
            forward_passes: 0,
            output_shape: Vec::new(),
        };
        model.load_all_params(table)?;

        log::info!(
            "decoder model built: {} layers, hidden {}, vocab {}, max {}x{} rows",
            model.config.num_layers,
            model.config.hidden_size,
            model.config.vocab_size,
            model.config.max_batch_size,
            model.config.max_step
        );
        Ok(model)
    }

    fn load_all_params(&mut self, table: &ParamTable) -> Result<()> {
        let mut offset = 0;
        offset += self
            .embedding
            .load_params(&mut self.graph, table, offset)?;
        offset += self
            .final_norm
            .load_params(&mut self.graph, table, offset)?;
        for block in &mut self.blocks {
            offset += block.load_params(&mut self.graph, table, offset)?;
        }
        offset += self
            .projection
            .load_params(&mut self.graph, table, offset)?;
        offset += self
            .generator
            .load_params(&mut self.graph, table, offset)?;

        if offset < table.len() {
            log::warn!(
                "weight table has {} unused trailing slots",
                table.len() - offset
            );
        }
        Ok(())
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn decode_state(&self) -> DecodeState {
        self.state
    }

    /// Emissions of the last `infer` call.
    pub fn steps_taken(&self) -> usize {
        self.steps_taken
    }

    /// Forward passes of the last `infer` call.
    pub fn forward_passes(&self) -> usize {
        self.forward_passes
    }

    // ------------------------------------------------------------------
    // External interface
    // ------------------------------------------------------------------

    pub fn input_count(&self) -> usize {
        1
    }

    /// Two outputs: token ids (slot 0) and sequence scores (slot 1).
    pub fn output_count(&self) -> usize {
        2
    }

    pub fn input_max_shape(&self, slot: usize) -> Result<Vec<usize>> {
        match slot {
            0 => Ok(vec![self.config.max_batch_size, self.config.max_step]),
            _ => Err(Error::InvalidInputIndex(slot)),
        }
    }

    pub fn input_dtype(&self, slot: usize) -> Result<DType> {
        match slot {
            0 => Ok(DType::U32),
            _ => Err(Error::InvalidInputIndex(slot)),
        }
    }

    pub fn output_max_shape(&self, slot: usize) -> Result<Vec<usize>> {
        match slot {
            0 => Ok(vec![self.config.max_batch_size, self.config.max_step]),
            1 => Ok(vec![self.config.max_batch_size]),
            _ => Err(Error::InvalidOutputIndex(slot)),
        }
    }

    pub fn output_dtype(&self, slot: usize) -> Result<DType> {
        match slot {
            0 => Ok(DType::U32),
            1 => Ok(DType::F32),
            _ => Err(Error::InvalidOutputIndex(slot)),
        }
    }

    /// Shape published by the last `infer` call.
    pub fn output_shape(&self, slot: usize) -> Result<Vec<usize>> {
        if self.output_shape.is_empty() {
            return Err(Error::config("no inference has been run"));
        }
        match slot {
            0 => Ok(self.output_shape.clone()),
            1 => Ok(vec![self.output_shape[0]]),
            _ => Err(Error::InvalidOutputIndex(slot)),
        }
    }

    /// Binds prompt token ids to input slot 0. Shape `[batch, prompt_len]`.
    pub fn set_input_tokens(&mut self, slot: usize, tokens: &Array2<u32>) -> Result<()> {
        if slot != 0 {
            return Err(Error::InvalidInputIndex(slot));
        }
        let (batch, prompt_len) = tokens.dim();
        if batch == 0 || batch > self.config.max_batch_size {
            return Err(Error::config(format!(
                "batch size {} outside 1..={}",
                batch, self.config.max_batch_size
            )));
        }
        // The prompt must leave room for at least one generated token.
        if prompt_len == 0 || prompt_len >= self.config.max_step {
            return Err(Error::config(format!(
                "prompt length {} outside 1..{}",
                prompt_len, self.config.max_step
            )));
        }
        if tokens.iter().any(|&t| t as usize >= self.config.vocab_size) {
            return Err(Error::config("prompt contains out-of-vocabulary ids"));
        }

        self.prompt = Some(tokens.rows().into_iter().map(|r| r.to_vec()).collect());
        Ok(())
    }

    pub async fn read_output_tokens(&self) -> Result<Array2<u32>> {
        let shape = self.output_shape(0)?;
        let (batch, len) = (shape[0], shape[1]);
        let raw = self
            .graph
            .read_u32_capacity(self.generator.out_tokens())
            .await?;

        let mut out = Array2::<u32>::zeros((batch, len));
        for b in 0..batch {
            for i in 0..len {
                out[[b, i]] = raw[b * self.config.max_step + i];
            }
        }
        Ok(out)
    }

    pub async fn read_output_scores(&self) -> Result<Array1<f32>> {
        let shape = self.output_shape(1)?;
        let raw = self
            .graph
            .read_f32_capacity(self.generator.out_scores())
            .await?;
        Ok(Array1::from_vec(raw[..shape[0]].to_vec()))
    }

    // ------------------------------------------------------------------
    // Decode loop
    // ------------------------------------------------------------------

    /// Runs the full decode loop on the bound input and publishes the final
    /// token ids and scores into the output variables.
    pub async fn infer(&mut self) -> Result<()> {
        let prompts = self
            .prompt
            .clone()
            .ok_or_else(|| Error::config("no input tokens bound"))?;
        let batch = prompts.len();
        let beam = self.config.beam_width;
        let rows = batch * beam;
        let prompt_len = prompts[0].len();
        let max_step = self.config.max_step;

        let mut sequences = SequenceState::new(&prompts, beam, max_step)?;
        self.generator.begin(&sequences);

        // Stage the input rows: prompts replicated per beam, padded to the
        // row stride. Synchronize so host writes are visible before use.
        let staged = sequences.to_row_matrix(self.config.padding_id);
        self.graph.write_u32(self.inp_tokens, &staged)?;
        self.graph.synchronize()?;

        self.state = DecodeState::Prefill;
        self.steps_taken = 0;
        self.forward_passes = 0;

        loop {
            let step = match self.state {
                DecodeState::Prefill => StepConfig {
                    batch: rows,
                    seq_len: prompt_len,
                    step_offset: 0,
                    max_seq: max_step,
                },
                DecodeState::Decode => StepConfig {
                    batch: rows,
                    seq_len: 1,
                    step_offset: prompt_len + self.steps_taken - 1,
                    max_seq: max_step,
                },
                DecodeState::Stopped => unreachable!("loop exits on stop"),
            };
            log::debug!(
                "{:?} pass: rows {}, seq {}, offset {}",
                self.state,
                step.batch,
                step.seq_len,
                step.step_offset
            );

            self.before_forward_all(step)?;
            self.forward_all()?;
            self.forward_passes += 1;

            let decision = self
                .generator
                .decide(&mut self.graph, &mut sequences)
                .await?;
            if decision.emitted {
                self.steps_taken += 1;
            }

            if decision.finished {
                self.state = DecodeState::Stopped;
                break;
            }
            if prompt_len + self.steps_taken >= max_step {
                // Hitting the step cap is the stop condition, not an error.
                log::debug!("step cap {} reached without stop signal", max_step);
                self.state = DecodeState::Stopped;
                break;
            }

            if beam > 1 {
                if let Some(indices) = &decision.reorder {
                    self.reorder_caches(indices, rows, prompt_len + self.steps_taken - 1)?;
                }
            }

            // This step's output tokens become the next step's input.
            self.graph
                .swap(self.inp_tokens, self.generator.out_tokens())?;
            self.state = DecodeState::Decode;
        }

        let published_len = prompt_len + self.steps_taken;
        self.generator
            .publish(&mut self.graph, &sequences, published_len)?;
        self.output_shape = vec![batch, published_len];
        self.graph.synchronize()?;

        log::debug!(
            "inference stopped after {} passes, {} emissions",
            self.forward_passes,
            self.steps_taken
        );
        Ok(())
    }

    /// The fixed pipeline order; identical on every step.
    fn before_forward_all(&mut self, step: StepConfig) -> Result<()> {
        self.embedding.before_forward(&mut self.graph, step)?;
        for block in &mut self.blocks {
            block.before_forward(&mut self.graph, step)?;
        }
        self.final_norm.before_forward(&mut self.graph, step)?;
        self.projection.before_forward(&mut self.graph, step)?;
        // The generator sees batch rows, not batch x beam.
        self.generator.before_forward(
            &mut self.graph,
            StepConfig {
                batch: step.batch / self.config.beam_width,
                ..step
            },
        )
    }

    fn forward_all(&mut self) -> Result<()> {
        let mut frame = StepFrame::begin(&self.graph);
        self.embedding.forward(&mut self.graph, &mut frame)?;
        for block in &mut self.blocks {
            block.forward(&mut self.graph, &mut frame)?;
        }
        self.final_norm.forward(&mut self.graph, &mut frame)?;
        self.projection.forward(&mut self.graph, &mut frame)?;
        self.generator.forward(&mut self.graph, &mut frame)?;
        frame.finish(&self.graph);
        Ok(())
    }

    fn reorder_caches(&mut self, indices: &[u32], rows: usize, filled: usize) -> Result<()> {
        self.graph.write_u32(self.beam_indices, indices)?;
        let mut frame = StepFrame::begin(&self.graph);
        for block in &mut self.blocks {
            block.reorder_cache(&mut self.graph, &mut frame, self.beam_indices, rows, filled)?;
        }
        frame.finish(&self.graph);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use ndarray::{array, ArrayView2};

    use super::*;
    use crate::generation::{DecodingStrategy, StrategyOutput};
    use crate::model::config::DecodingKind;

    /// Emits a fixed token for every row until `stop_after` emissions, then
    /// signals stop without emitting.
    struct StubStrategy {
        emit: u32,
        stop_after: Option<usize>,
        calls: Arc<AtomicUsize>,
    }

    impl DecodingStrategy for StubStrategy {
        fn advance(
            &mut self,
            _logits: ArrayView2<f32>,
            state: &mut SequenceState,
        ) -> Result<StrategyOutput> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(limit) = self.stop_after {
                if call > limit {
                    return Ok(StrategyOutput {
                        next_tokens: Vec::new(),
                        reorder: None,
                        finished: true,
                    });
                }
            }
            let rows = state.num_rows();
            for r in 0..rows {
                state.rows[r].push(self.emit);
            }
            Ok(StrategyOutput {
                next_tokens: vec![self.emit; rows],
                reorder: None,
                finished: false,
            })
        }
    }

    fn build_stub_model(
        stop_after: Option<usize>,
        calls: Arc<AtomicUsize>,
    ) -> DecoderModel {
        let config = DecoderConfig::tiny_for_tests();
        let table = ParamTable::synthetic(&config, 3).unwrap();
        let strategy = Box::new(StubStrategy {
            emit: 99,
            stop_after,
            calls,
        });
        DecoderModel::build_with_strategy(GraphContext::for_cpu(), config, &table, strategy)
            .unwrap()
    }

    #[tokio::test]
    async fn test_decode_loop_stops_on_strategy_signal() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut model = build_stub_model(Some(2), calls.clone());

        model
            .set_input_tokens(0, &array![[45u32, 90, 12]])
            .unwrap();
        model.infer().await.unwrap();

        assert_eq!(model.output_shape(0).unwrap(), vec![1, 5]);
        let tokens = model.read_output_tokens().await.unwrap();
        assert_eq!(tokens, array![[45u32, 90, 12, 99, 99]]);
        assert_eq!(model.decode_state(), DecodeState::Stopped);
    }

    #[tokio::test]
    async fn test_decode_loop_halts_at_step_cap() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut model = build_stub_model(None, calls.clone());

        model
            .set_input_tokens(0, &array![[45u32, 90, 12]])
            .unwrap();
        model.infer().await.unwrap();

        // max_step 8, prompt 3: exactly max_step - prompt_len transitions.
        assert_eq!(model.output_shape(0).unwrap(), vec![1, 8]);
        assert_eq!(model.forward_passes(), 5);
        assert_eq!(model.steps_taken(), 5);

        let tokens = model.read_output_tokens().await.unwrap();
        assert_eq!(tokens, array![[45u32, 90, 12, 99, 99, 99, 99, 99]]);
    }

    #[tokio::test]
    async fn test_no_forward_after_stop_signal() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut model = build_stub_model(Some(2), calls.clone());

        model.set_input_tokens(0, &array![[45u32, 90, 12]]).unwrap();
        model.infer().await.unwrap();

        // One strategy call per forward pass; nothing runs past the stop.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(model.forward_passes(), 3);
    }

    #[tokio::test]
    async fn test_batched_prompts_emit_per_row() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut model = build_stub_model(Some(1), calls);

        model
            .set_input_tokens(0, &array![[5u32, 6], [7, 8]])
            .unwrap();
        model.infer().await.unwrap();

        assert_eq!(model.output_shape(0).unwrap(), vec![2, 3]);
        let tokens = model.read_output_tokens().await.unwrap();
        assert_eq!(tokens, array![[5u32, 6, 99], [7, 8, 99]]);
    }

    #[test]
    fn test_invalid_slot_indices_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut model = build_stub_model(Some(1), calls);

        assert!(matches!(
            model.set_input_tokens(1, &array![[1u32]]),
            Err(Error::InvalidInputIndex(1))
        ));
        assert!(matches!(
            model.input_max_shape(3),
            Err(Error::InvalidInputIndex(3))
        ));
        assert!(matches!(
            model.output_max_shape(2),
            Err(Error::InvalidOutputIndex(2))
        ));
        assert!(matches!(
            model.output_dtype(5),
            Err(Error::InvalidOutputIndex(5))
        ));
    }

    #[test]
    fn test_introspection_shapes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let model = build_stub_model(Some(1), calls);

        assert_eq!(model.input_count(), 1);
        assert_eq!(model.output_count(), 2);
        assert_eq!(model.input_max_shape(0).unwrap(), vec![2, 8]);
        assert_eq!(model.output_max_shape(0).unwrap(), vec![2, 8]);
        assert_eq!(model.output_max_shape(1).unwrap(), vec![2]);
        assert_eq!(model.input_dtype(0).unwrap(), DType::U32);
        assert_eq!(model.output_dtype(0).unwrap(), DType::U32);
        assert_eq!(model.output_dtype(1).unwrap(), DType::F32);

        // No inference yet: dynamic shape is unpublished.
        assert!(model.output_shape(0).is_err());
    }

    #[test]
    fn test_prompt_validation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut model = build_stub_model(Some(1), calls);

        // Prompt must leave room to generate.
        assert!(model
            .set_input_tokens(0, &array![[1u32, 2, 3, 4, 5, 6, 7, 8]])
            .is_err());
        // Out-of-vocabulary id.
        assert!(model.set_input_tokens(0, &array![[1000u32]]).is_err());
        // Batch above the declared maximum.
        assert!(model
            .set_input_tokens(0, &array![[1u32], [2], [3]])
            .is_err());
    }

    #[tokio::test]
    async fn test_infer_without_input_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut model = build_stub_model(Some(1), calls);
        assert!(matches!(model.infer().await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_greedy_end_to_end_is_deterministic() {
        let config = DecoderConfig::tiny_for_tests();
        let table = ParamTable::synthetic(&config, 11).unwrap();

        let mut a = DecoderModel::build(GraphContext::for_cpu(), config.clone(), &table).unwrap();
        let mut b = DecoderModel::build(GraphContext::for_cpu(), config, &table).unwrap();

        a.set_input_tokens(0, &array![[45u32, 90, 12]]).unwrap();
        b.set_input_tokens(0, &array![[45u32, 90, 12]]).unwrap();
        a.infer().await.unwrap();
        b.infer().await.unwrap();

        let ta = a.read_output_tokens().await.unwrap();
        let tb = b.read_output_tokens().await.unwrap();
        assert_eq!(ta, tb);
        assert_eq!(ta.row(0).to_vec()[..3], [45, 90, 12]);
        assert!(a.output_shape(0).unwrap()[1] <= 8);
    }

    #[tokio::test]
    async fn test_beam_search_end_to_end() {
        let mut config = DecoderConfig::tiny_for_tests();
        config.max_batch_size = 1;
        config.beam_width = 3;
        config.decoding = DecodingKind::BeamSearch { length_penalty: 1.0 };
        let table = ParamTable::synthetic(&config, 17).unwrap();

        let mut model =
            DecoderModel::build(GraphContext::for_cpu(), config, &table).unwrap();
        model.set_input_tokens(0, &array![[45u32, 90, 12]]).unwrap();
        model.infer().await.unwrap();

        assert_eq!(model.decode_state(), DecodeState::Stopped);
        let shape = model.output_shape(0).unwrap();
        assert_eq!(shape[0], 1);
        assert!(shape[1] > 3 && shape[1] <= 8);

        let tokens = model.read_output_tokens().await.unwrap();
        assert_eq!(tokens.row(0).to_vec()[..3], [45, 90, 12]);

        let scores = model.read_output_scores().await.unwrap();
        assert_eq!(scores.len(), 1);
        assert!(scores[0].is_finite() && scores[0] <= 0.0);
    }

    /// Scripted beam strategy: distinct tokens per beam on the first call, a
    /// reorder on the second, stop on the third.
    struct ScriptedBeamStrategy {
        calls: usize,
        reorder: Vec<u32>,
    }

    impl DecodingStrategy for ScriptedBeamStrategy {
        fn advance(
            &mut self,
            _logits: ArrayView2<f32>,
            state: &mut SequenceState,
        ) -> Result<StrategyOutput> {
            self.calls += 1;
            let rows = state.num_rows();
            match self.calls {
                1 => {
                    let tokens: Vec<u32> = (0..rows as u32).map(|r| 10 + r).collect();
                    for (r, &t) in tokens.iter().enumerate() {
                        state.rows[r].push(t);
                    }
                    Ok(StrategyOutput {
                        next_tokens: tokens,
                        reorder: None,
                        finished: false,
                    })
                }
                2 => {
                    let tokens: Vec<u32> = (0..rows as u32).map(|r| 20 + r).collect();
                    for (r, &t) in tokens.iter().enumerate() {
                        state.rows[r].push(t);
                    }
                    Ok(StrategyOutput {
                        next_tokens: tokens,
                        reorder: Some(self.reorder.clone()),
                        finished: false,
                    })
                }
                _ => Ok(StrategyOutput {
                    next_tokens: Vec::new(),
                    reorder: None,
                    finished: true,
                }),
            }
        }
    }

    #[tokio::test]
    async fn test_beam_reorder_gathers_cache_rows() {
        let mut config = DecoderConfig::tiny_for_tests();
        config.max_batch_size = 1;
        config.beam_width = 4;
        config.decoding = DecodingKind::BeamSearch { length_penalty: 1.0 };
        let table = ParamTable::synthetic(&config, 5).unwrap();

        let reorder = vec![2u32, 0, 3, 1];
        let strategy = Box::new(ScriptedBeamStrategy {
            calls: 0,
            reorder: reorder.clone(),
        });
        let mut model =
            DecoderModel::build_with_strategy(GraphContext::for_cpu(), config, &table, strategy)
                .unwrap();

        model.set_input_tokens(0, &array![[45u32, 90, 12]]).unwrap();

        // Snapshot hook: run the loop, then verify against a reference
        // gather of the state the cache held before the reorder. The cache
        // row stride covers [heads, max_step, head_dim].
        model.infer().await.unwrap();

        // After the reorder at filled=4, pass 3 wrote position 4 into the
        // reordered cache. Rebuild the expectation from a twin model that
        // never reorders and compare the first `filled` positions.
        let config2 = {
            let mut c = DecoderConfig::tiny_for_tests();
            c.max_batch_size = 1;
            c.beam_width = 4;
            c.decoding = DecodingKind::BeamSearch { length_penalty: 1.0 };
            c
        };
        let table2 = ParamTable::synthetic(&config2, 5).unwrap();
        let strategy2 = Box::new(ScriptedBeamStrategy {
            calls: 0,
            reorder: vec![0, 1, 2, 3],
        });
        let mut twin =
            DecoderModel::build_with_strategy(GraphContext::for_cpu(), config2, &table2, strategy2)
                .unwrap();
        twin.set_input_tokens(0, &array![[45u32, 90, 12]]).unwrap();
        twin.infer().await.unwrap();

        let heads = 2;
        let head_dim = 8;
        let max_step = 8;
        let row_stride = heads * max_step * head_dim;
        let filled = 4;

        for (block, twin_block) in model.blocks.iter().zip(twin.blocks.iter()) {
            let cache = model
                .graph
                .read_f32_capacity(block.attention().cache_k())
                .await
                .unwrap();
            let reference = twin
                .graph
                .read_f32_capacity(twin_block.attention().cache_k())
                .await
                .unwrap();

            for (dst_row, &src_row) in reorder.iter().enumerate() {
                for h in 0..heads {
                    for p in 0..filled {
                        for d in 0..head_dim {
                            let idx = |row: usize| {
                                ((row * heads + h) * max_step + p) * head_dim + d
                            };
                            assert_eq!(
                                cache[idx(dst_row)],
                                reference[idx(src_row as usize)],
                                "cache row mismatch at row {dst_row} head {h} pos {p} dim {d}"
                            );
                        }
                    }
                }
            }
        }
    }
}
